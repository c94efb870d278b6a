pub mod dispatch;
pub mod guard;
pub mod offers;
pub mod orders;
pub mod rating;
pub mod timers;
