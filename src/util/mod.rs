pub mod dotenv;
pub mod id;
