mod link;
mod pcap;
mod queue;
mod reader;
mod signal;
mod watchdog;
mod writer;

pub use link::SlipLink;
