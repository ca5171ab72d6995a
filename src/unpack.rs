//! Decompressors
//!
//! `bzip` and `tar` are done in-process; `xrit` runs the external
//! xRITDecompress tool, which writes `<name minus C_>__` next to its input.

use bzip2::read::BzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use crate::error::{MoveError, Result};
use crate::logging::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Bzip,
    Tar,
    Xrit,
}

impl FromStr for Compression {
    type Err = MoveError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bzip" => Ok(Compression::Bzip),
            "tar" => Ok(Compression::Tar),
            "xrit" => Ok(Compression::Xrit),
            other => Err(MoveError::Config(format!("unknown compression '{}'", other))),
        }
    }
}

impl Compression {
    /// File name endings recognised as compressed
    pub fn endings(&self) -> &'static [&'static str] {
        match self {
            Compression::Xrit => &["C_"],
            Compression::Tar => &[".tar", ".tar.bz2"],
            Compression::Bzip => &[".bz2"],
        }
    }

    pub fn is_compressed(&self, name: &str) -> bool {
        self.endings().iter().any(|e| name.ends_with(e))
    }
}

/// Decompression settings of one chain
#[derive(Debug, Clone)]
pub struct Unpacker {
    pub compression: Compression,
    /// Output directory; defaults to the directory of the input file
    pub working_directory: Option<PathBuf>,
    /// Path of the xRITDecompress executable
    pub xritdecompressor: Option<String>,
}

impl Unpacker {
    pub fn new(compression: &str, working_directory: Option<&str>, xritdecompressor: Option<&str>) -> Result<Self> {
        Ok(Unpacker {
            compression: compression.parse()?,
            working_directory: working_directory.map(PathBuf::from),
            xritdecompressor: xritdecompressor.map(str::to_string),
        })
    }

    fn output_dir(&self, path: &Path) -> PathBuf {
        match &self.working_directory {
            Some(dir) => dir.clone(),
            None => path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(".")),
        }
    }

    /// Unpacks `path` and returns the produced files
    ///
    /// Files that do not carry a compressed ending come back unchanged.
    pub fn unpack(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.compression.is_compressed(&name) {
            return Ok(vec![path.to_path_buf()]);
        }
        let out_dir = self.output_dir(path);
        fs::create_dir_all(&out_dir)?;
        let produced = match self.compression {
            Compression::Bzip => vec![bunzip(path, &out_dir, &name)?],
            Compression::Tar => untar(path, &out_dir, &name)?,
            Compression::Xrit => vec![self.xrit(path, &out_dir, &name)?],
        };
        debug(&format!("Unpacked {} into {:?}", path.display(), produced), None);
        Ok(produced)
    }

    fn xrit(&self, path: &Path, out_dir: &Path, name: &str) -> Result<PathBuf> {
        let cmd = self.xritdecompressor.as_deref().ok_or_else(|| {
            MoveError::Config("path to 'xRITDecompress' not set, use the 'xritdecompressor' option".into())
        })?;
        let output = Command::new(cmd).arg(path).current_dir(out_dir).output()?;
        if !output.status.success() {
            return Err(MoveError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} failed on {}: {}",
                    cmd,
                    path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )));
        }
        Ok(out_dir.join(format!("{}__", &name[..name.len() - 2])))
    }
}

fn bunzip(path: &Path, out_dir: &Path, name: &str) -> Result<PathBuf> {
    let target = out_dir.join(&name[..name.len() - ".bz2".len()]);
    if target.exists() {
        return Ok(target);
    }
    let mut decoder = BzDecoder::new(BufReader::new(File::open(path)?));
    // write aside and rename, so a half-written file is never picked up
    let tmp = out_dir.join(format!(".{}.part", name));
    let written = File::create(&tmp).and_then(|mut out| io::copy(&mut decoder, &mut out));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fs::rename(&tmp, &target)?;
    Ok(target)
}

fn untar(path: &Path, out_dir: &Path, name: &str) -> Result<Vec<PathBuf>> {
    let file = BufReader::new(File::open(path)?);
    if name.ends_with(".bz2") {
        extract(tar::Archive::new(BzDecoder::new(file)), out_dir)
    } else {
        extract(tar::Archive::new(file), out_dir)
    }
}

fn extract<R: io::Read>(mut archive: tar::Archive<R>, out_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut produced = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        // unpack_in refuses paths escaping out_dir
        if entry.unpack_in(out_dir)? && entry.header().entry_type().is_file() {
            produced.push(out_dir.join(relative));
        }
    }
    Ok(produced)
}
