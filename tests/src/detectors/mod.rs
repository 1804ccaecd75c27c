mod bug_files;
