pub mod gd;
