mod sections;
