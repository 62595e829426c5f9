pub mod futures;
pub mod streams;
