pub mod audit_logger;
pub mod chunk_decoder;
pub mod output_normalizer;
pub mod path_utils;
