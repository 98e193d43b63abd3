use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::config::RunConfig;

const MERGE_BUFFER: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("merge failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-tuple spool written during extraction: `<procedure>_<solID>.spool`.
pub fn spool_path(dir: &Path, procedure: &str, sol_id: &str) -> PathBuf {
    dir.join(format!("{procedure}_{sol_id}.spool"))
}

/// Final merged output for one procedure: `<procedure>.txt`.
pub fn merged_path(dir: &Path, procedure: &str) -> PathBuf {
    dir.join(format!("{procedure}.txt"))
}

/// Concatenates each non-chunked procedure's spool files into its final
/// `<procedure>.txt`, in lexicographic file-name order, deleting each spool
/// after it is copied. Chunked procedures already wrote their final files
/// and are skipped.
pub fn merge_spools(cfg: &RunConfig) -> Result<(), MergeError> {
    for procedure in &cfg.procedures {
        if cfg.is_chunked(procedure) {
            debug!(procedure = %procedure, "skipping merge for chunked procedure");
            continue;
        }
        merge_one(&cfg.spool_output_path, procedure)?;
    }
    Ok(())
}

fn merge_one(dir: &Path, procedure: &str) -> Result<(), MergeError> {
    let prefix = format!("{procedure}_");
    let mut spools: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|source| MergeError::Io {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(&prefix) && name.ends_with(".spool"))
                .unwrap_or(false)
        })
        .collect();
    spools.sort();

    let target = merged_path(dir, procedure);
    let out = File::create(&target).map_err(|source| MergeError::Io {
        path: target.clone(),
        source,
    })?;
    let mut writer = BufWriter::with_capacity(MERGE_BUFFER, out);

    for spool in &spools {
        let mut reader =
            BufReader::new(File::open(spool).map_err(|source| MergeError::Io {
                path: spool.clone(),
                source,
            })?);
        io::copy(&mut reader, &mut writer).map_err(|source| MergeError::Io {
            path: spool.clone(),
            source,
        })?;
        fs::remove_file(spool).map_err(|source| MergeError::Io {
            path: spool.clone(),
            source,
        })?;
    }
    io::Write::flush(&mut writer).map_err(|source| MergeError::Io {
        path: target.clone(),
        source,
    })?;

    info!(procedure = %procedure, files = spools.len(), target = %target.display(), "merged spools");
    Ok(())
}
