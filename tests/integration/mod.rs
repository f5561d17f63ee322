mod bulkcm_tests;
mod parquet_tests;
mod pipeline_tests;
