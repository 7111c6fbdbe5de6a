pub mod config;
pub mod constants;
pub mod daily;
pub mod error;
pub mod service;
#[cfg(test)]
pub mod test;
pub mod util {
    pub mod file_utils;
    pub mod market_data;
    pub mod run_cache;
    #[cfg(test)]
    pub mod test_utils;
}

/// Package metadata generated at build time
pub mod build_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}
