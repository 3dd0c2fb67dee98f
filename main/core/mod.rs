pub mod configuration;
pub mod controller;
pub mod logger;
pub mod main;
pub mod preload;
pub mod runahead;
pub mod scheduler;
pub mod work;
pub mod worker;
