mod frames;
mod query_runs;
mod records;
