pub mod compress;
pub mod config;
pub mod digest;
pub mod dump;
pub mod encrypt;
pub mod file_ext;
pub mod finish;
pub mod notifications;
pub mod orchestrator;
pub mod pipe;
pub mod pipeline;
pub mod redacted;
pub mod result_error;
pub mod retention;
pub mod scheduler;
pub mod secret;
pub mod storage;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

macro_rules! function_path {
    () => {
        concat!(module_path!(), "::", function_name!(), " ", file!(), ":", line!())
    };
}

pub(crate) use function_path;
