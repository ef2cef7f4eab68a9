//! zstd compression, either through the `zstd` binary or in-process.
//!
//! Both produce standard zstd frames, so an artifact compressed by one can
//! be restored by the other.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use pgsafe_core::config::{BackupConfig, CodecKind};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::ToolError;
use crate::process::run_tool;

#[async_trait]
pub trait Codec: Send + Sync {
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;

    async fn decompress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError>;
}

pub fn codec_from_config(cfg: &BackupConfig) -> Arc<dyn Codec> {
    match cfg.codec {
        CodecKind::External => Arc::new(ExternalZstd::new(
            cfg.zstd_binary.clone(),
            cfg.compression_level,
        )),
        CodecKind::Builtin => Arc::new(BuiltinZstd::new(cfg.compression_level)),
    }
}

/// Shells out to `zstd`
pub struct ExternalZstd {
    binary: PathBuf,
    level: i32,
}

impl ExternalZstd {
    pub fn new(binary: impl Into<PathBuf>, level: i32) -> Self {
        Self {
            binary: binary.into(),
            level,
        }
    }

    fn compress_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f");
        // levels 20-22 are refused without --ultra
        if self.level > 19 {
            cmd.arg("--ultra");
        }
        cmd.arg(format!("-{}", self.level))
            .arg(input)
            .arg("-o")
            .arg(output);
        cmd
    }

    fn decompress_command(&self, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-d").arg("-f").arg(input).arg("-o").arg(output);
        cmd
    }
}

#[async_trait]
impl Codec for ExternalZstd {
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        info!(file = %output.display(), level = self.level, "compressing");
        run_tool(self.compress_command(input, output), "zstd", cancel).await
    }

    async fn decompress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        info!(file = %output.display(), "decompressing");
        run_tool(self.decompress_command(input, output), "zstd", cancel).await
    }
}

/// In-process zstd on the blocking pool
pub struct BuiltinZstd {
    level: i32,
}

impl BuiltinZstd {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Encode(i32),
    Decode,
}

fn transcode(input: &Path, output: &Path, direction: Direction) -> Result<(), ToolError> {
    let src = File::open(input).map_err(|e| ToolError::io("opening", input, e))?;
    let dst = File::create(output).map_err(|e| ToolError::io("creating", output, e))?;

    let result = (|| {
        let mut reader = BufReader::new(src);
        let mut writer = BufWriter::new(dst);
        match direction {
            Direction::Encode(level) => zstd::stream::copy_encode(&mut reader, &mut writer, level),
            Direction::Decode => zstd::stream::copy_decode(&mut reader, &mut writer),
        }?;
        writer.flush()?;
        writer.get_ref().sync_all()
    })();

    result.map_err(|e| {
        let _ = std::fs::remove_file(output);
        ToolError::io("transcoding into", output, e)
    })
}

impl BuiltinZstd {
    async fn run(
        &self,
        input: &Path,
        output: &Path,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled {
                program: "zstd (builtin)".into(),
            });
        }
        let (input, output) = (input.to_path_buf(), output.to_path_buf());
        tokio::task::spawn_blocking(move || transcode(&input, &output, direction))
            .await
            .map_err(ToolError::Task)?
    }
}

#[async_trait]
impl Codec for BuiltinZstd {
    async fn compress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        info!(file = %output.display(), level = self.level, "compressing (builtin)");
        self.run(input, output, Direction::Encode(self.level), cancel)
            .await
    }

    async fn decompress(
        &self,
        input: &Path,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), ToolError> {
        info!(file = %output.display(), "decompressing (builtin)");
        self.run(input, output, Direction::Decode, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;
    use tempfile::TempDir;

    fn args(cmd: &Command) -> Vec<&OsStr> {
        cmd.as_std().get_args().collect()
    }

    #[test]
    fn test_external_command_lines() {
        let codec = ExternalZstd::new("zstd", 3);
        let c = codec.compress_command(Path::new("a.dump"), Path::new("a.dump.zst"));
        assert_eq!(args(&c), vec!["-f", "-3", "a.dump", "-o", "a.dump.zst"]);

        let d = codec.decompress_command(Path::new("a.dump.zst"), Path::new("a.dump"));
        assert_eq!(args(&d), vec!["-d", "-f", "a.dump.zst", "-o", "a.dump"]);
    }

    #[test]
    fn test_external_ultra_levels() {
        let codec = ExternalZstd::new("zstd", 22);
        let c = codec.compress_command(Path::new("a"), Path::new("b"));
        assert_eq!(args(&c)[..3], ["-f", "--ultra", "-22"]);
    }

    #[tokio::test]
    async fn test_builtin_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let dump = tmp.path().join("a.dump");
        let packed = tmp.path().join("a.dump.zst");
        let restored = tmp.path().join("restored.dump");
        let data: Vec<u8> = (0..200_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        std::fs::write(&dump, &data).unwrap();

        let codec = BuiltinZstd::new(3);
        let cancel = CancellationToken::new();
        codec.compress(&dump, &packed, &cancel).await.unwrap();
        assert!(std::fs::metadata(&packed).unwrap().len() < data.len() as u64);

        codec.decompress(&packed, &restored, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), data);
    }

    #[tokio::test]
    async fn test_builtin_corrupt_input_leaves_no_output() {
        let tmp = TempDir::new().unwrap();
        let bad = tmp.path().join("bad.zst");
        let out = tmp.path().join("bad");
        std::fs::write(&bad, b"definitely not a zstd frame").unwrap();

        let err = BuiltinZstd::new(3)
            .decompress(&bad, &out, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Io { .. }));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_codec_from_config_selects_implementation() {
        let tmp = TempDir::new().unwrap();
        let dump = tmp.path().join("a.dump");
        let packed = tmp.path().join("a.dump.zst");
        std::fs::write(&dump, b"PGDMP").unwrap();
        let cancel = CancellationToken::new();

        // a missing zstd binary only matters to the external codec
        let mut cfg = BackupConfig {
            codec: CodecKind::Builtin,
            zstd_binary: tmp.path().join("no-such-zstd"),
            ..Default::default()
        };
        codec_from_config(&cfg)
            .compress(&dump, &packed, &cancel)
            .await
            .unwrap();
        assert!(packed.exists());

        cfg.codec = CodecKind::External;
        let err = codec_from_config(&cfg)
            .compress(&dump, &packed, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }), "{err}");
    }
}
