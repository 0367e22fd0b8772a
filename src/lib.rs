pub mod dispatcher;
pub mod events;
pub mod tftp_protocol;
pub mod transfer;
