pub mod basic_funclib;
