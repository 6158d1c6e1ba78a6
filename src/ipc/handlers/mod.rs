pub mod backup;
pub mod behavior;
pub mod classes;
pub mod core;
pub mod grades;
pub mod sheet;
pub mod structures;
pub mod students;
