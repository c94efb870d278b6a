pub mod driver;
pub mod driver_request;
pub mod menu;
pub mod order;
pub mod review;
pub mod service_order;
