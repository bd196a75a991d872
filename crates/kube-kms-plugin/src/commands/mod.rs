pub mod key_id;
pub mod serve;
