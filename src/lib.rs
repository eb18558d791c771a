//! # db-backup
//!
//! A scheduled backup engine for MySQL/MariaDB-compatible servers.
//!
//! ## Features
//!
//! - **Streaming dumps**: `mysqldump` output is never buffered in full
//! - **Compression**: XZ (LZMA, optionally multi-threaded) or gzip
//! - **Encryption**: Age encryption with passphrase support
//! - **Integrity**: SHA-256 over the stored bytes, recorded in a manifest
//! - **Storage**: local directory or S3-compatible object store, with
//!   atomic finalize so partial uploads are never listed
//! - **Retention**: count and age bounds, newest backup always kept
//! - **Concurrency**: bounded worker pool, one in-flight job per target
//!
//! ## Quick Start
//!
//! ```no_run
//! use db_backup::backup::config::AppConfig;
//! use db_backup::backup::orchestrator::cancel::CancelToken;
//! use db_backup::backup::scheduler::Runner;
//!
//! let config = AppConfig::load("config.yml")?;
//! let runner = Runner::from_config(&config)?;
//! let report = runner.run_once(&[], &CancelToken::new())?;
//! println!("{report}");
//! std::process::exit(report.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
