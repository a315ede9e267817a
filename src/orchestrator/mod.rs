//! 编排层模块

pub mod batch_processor;

pub use batch_processor::{
    parse_batch_params, split_enhancement, BatchParams, BatchProcessor, BatchStats,
};
