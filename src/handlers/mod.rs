pub mod health_handlers;
pub mod identity;
pub mod object_handlers;
pub mod upload_handlers;
