pub mod amqp;
pub mod events;
