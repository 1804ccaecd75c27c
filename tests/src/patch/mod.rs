mod access_control;
mod deployment;
mod overflow;
mod reentrancy;
mod relocation;
