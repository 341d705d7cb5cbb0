//! Batch script rendering.

use std::fmt::Write as _;
use std::path::Path;

use crate::routing::JobType;

/// Wall-clock limit applied when the configuration does not set one (1 day).
pub const DEFAULT_TIME_LIMIT: &str = "1-00:00";

/// A rendered `#SBATCH` script for one issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchScript {
    contents: String,
}

impl BatchScript {
    /// Render the script.
    ///
    /// `job_name` is the issue id; stdout/stderr land in `work_dir` as
    /// `job_%j.out` / `job_%j.err`. `activation` is sourced before the
    /// command so the automation script runs in its own environment.
    pub fn render(
        job_name: &str,
        job_type: &JobType,
        time_limit: &str,
        partition: Option<&str>,
        work_dir: &Path,
        activation: Option<&Path>,
        command: &str,
    ) -> Self {
        let wd = work_dir.display();
        let mut s = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(s, "#!/bin/bash");
        let _ = writeln!(s, "#SBATCH -N 1");
        let _ = writeln!(s, "#SBATCH --ntasks={}", job_type.cpus);
        let _ = writeln!(s, "#SBATCH --mem={}", job_type.memory_mb);
        let _ = writeln!(s, "#SBATCH --time={}", time_limit);
        let _ = writeln!(s, "#SBATCH --job-name={}", job_name);
        if let Some(partition) = partition {
            let _ = writeln!(s, "#SBATCH --partition={}", partition);
        }
        let _ = writeln!(s, "#SBATCH -o {}/job_%j.out", wd);
        let _ = writeln!(s, "#SBATCH -e {}/job_%j.err", wd);
        if let Some(activation) = activation {
            let _ = writeln!(s, "source {}", activation.display());
        }
        let _ = writeln!(s, "{}", command);
        Self { contents: s }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Write to `path` and mark it executable.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, &self.contents)?;
        make_executable(path)
    }
}

/// `chmod +x` semantics: every read bit gains the matching execute bit.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut perms = std::fs::metadata(path)?.permissions();
    let mode = perms.mode();
    perms.set_mode(mode | ((mode & 0o444) >> 2));
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
