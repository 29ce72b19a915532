pub mod config;
pub mod error;
pub mod nfq_message;
pub mod packet;
pub mod packet_list;
pub mod pipeline;
pub mod stage;
pub mod timer;
