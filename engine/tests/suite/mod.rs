mod cancellation;
mod concurrency;
mod config_file;
mod send_path;
