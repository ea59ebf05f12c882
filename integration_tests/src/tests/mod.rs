mod restart_test;
pub use restart_test::*;
mod storage_retrieval_test;
pub use storage_retrieval_test::*;
