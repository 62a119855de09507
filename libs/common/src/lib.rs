pub mod id;

