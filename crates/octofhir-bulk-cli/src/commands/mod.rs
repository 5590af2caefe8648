pub mod bulk;
pub mod rest;
