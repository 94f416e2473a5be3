pub mod algorithm;
pub mod history;
pub mod matcher;
