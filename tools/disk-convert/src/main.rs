use std::fs::File;
use std::io::{BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use disk_image::sprs::{decode_sprs, encode_sprs};
use disk_image::vhd::{DEFAULT_BLOCK_SIZE, VHD_FOOTER_SIZE};
use disk_image::{
    decode_vhd, detect_format, encode_dynamic_vhd, inspect, DecodeOptions, DiskFormat,
    DynamicVhdConfig, FileBackend, ImageInfo, ImageSource, Phase, Progress, SectorSource,
    StorageBackend,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::info;
use tracing_subscriber::EnvFilter;

// A safety guard: converting a disk requires scanning it block-by-block. Extremely large disks can
// cause accidental multi-hour conversions or huge allocation tables.
const DEFAULT_ABSURD_DISK_SIZE_BYTES: u64 = 16 * 1024 * 1024 * 1024 * 1024; // 16 TiB
const DEFAULT_ABSURD_TABLE_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

#[derive(Parser, Debug)]
#[command(
    name = "disk-convert",
    version,
    about = "Convert between flat disk images, dynamic VHD and SPRS sparse images."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Encode a flat image (or fixed VHD) as a dynamic VHD
    ToDynamic(ToDynamicArgs),
    /// Expand a VHD (fixed or dynamic) or SPRS image into a flat image
    ToFlat(ToFlatArgs),
    /// Encode a flat image (or fixed VHD) as an SPRS sector list
    ToSprs(ToSprsArgs),
    /// Print what an image contains
    Info(InfoArgs),
}

#[derive(Args, Debug)]
struct OutputArgs {
    /// Suppress progress output
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet: bool,

    /// Allow overwriting outputs and bypass safety checks
    #[arg(long, action = clap::ArgAction::SetTrue)]
    force: bool,
}

#[derive(Args, Debug)]
struct ToDynamicArgs {
    /// Input image path (raw or fixed VHD; auto-detected)
    input: PathBuf,

    /// Output dynamic VHD path
    output: PathBuf,

    /// VHD block size in bytes (power of two; multiple of 512)
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size_bytes: u32,

    /// Worker threads for the block scan (defaults to available parallelism)
    #[arg(long, value_name = "N")]
    threads: Option<NonZeroUsize>,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
struct ToFlatArgs {
    /// Input image path (VHD or SPRS; auto-detected)
    input: PathBuf,

    /// Output flat image path
    output: PathBuf,

    /// Warn on footer/header checksum mismatches instead of failing
    #[arg(long, action = clap::ArgAction::SetTrue)]
    ignore_checksums: bool,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
struct ToSprsArgs {
    /// Input image path (raw or fixed VHD; auto-detected)
    input: PathBuf,

    /// Output SPRS path
    output: PathBuf,

    #[command(flatten)]
    output_args: OutputArgs,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Image path
    input: PathBuf,

    /// Print machine-readable JSON instead of text
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Report checksum mismatches as warnings instead of failing
    #[arg(long, action = clap::ArgAction::SetTrue)]
    ignore_checksums: bool,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::ToDynamic(args) => to_dynamic(args),
        Command::ToFlat(args) => to_flat(args),
        Command::ToSprs(args) => to_sprs(args),
        Command::Info(args) => print_info(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_source(path: &Path) -> anyhow::Result<ImageSource<FileBackend>> {
    let backend = FileBackend::open_read_only(path)
        .with_context(|| format!("open input {}", path.display()))?;
    // Check the raw length: the sector source itself drops a trailing partial sector.
    let file_len = backend
        .len()
        .with_context(|| format!("stat input {}", path.display()))?;
    let data_len = match detect_format(&backend).context("detect input format")? {
        DiskFormat::VhdFixed => file_len.saturating_sub(VHD_FOOTER_SIZE as u64),
        _ => file_len,
    };
    validate_disk_size("input", data_len)?;

    let source = ImageSource::open(backend)
        .with_context(|| format!("open input disk {} (auto-detect)", path.display()))?;
    Ok(source)
}

fn to_dynamic(args: ToDynamicArgs) -> anyhow::Result<()> {
    let source = open_source(&args.input)?;
    let capacity = source.capacity_bytes();

    let config = DynamicVhdConfig {
        block_size_bytes: args.block_size_bytes,
        scan_threads: args.threads.unwrap_or_else(default_threads),
        ..Default::default()
    };
    config.validate().context("invalid --block-size-bytes")?;
    enforce_absurd_limits(capacity, args.block_size_bytes, args.output_args.force)?;

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        capacity,
        kind = ?source.kind(),
        block_size = args.block_size_bytes,
        threads = config.scan_threads.get(),
        "encoding dynamic vhd"
    );

    let mut progress = BarProgress::new(args.output_args.quiet);
    let summary = write_output(&args.output, args.output_args.force, |out| {
        encode_dynamic_vhd(&source, out, &config, &mut progress).context("encode dynamic vhd")
    })?;

    info!(
        total_blocks = summary.total_blocks,
        allocated_blocks = summary.allocated_blocks,
        bytes_written = summary.bytes_written,
        "wrote {}",
        args.output.display()
    );
    Ok(())
}

fn to_flat(args: ToFlatArgs) -> anyhow::Result<()> {
    let backend = FileBackend::open_read_only(&args.input)
        .with_context(|| format!("open input {}", args.input.display()))?;
    let format = detect_format(&backend).context("detect input format")?;
    let options = DecodeOptions {
        verify_checksums: !args.ignore_checksums,
    };

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        format = format.name(),
        "expanding to flat image"
    );

    let mut progress = BarProgress::new(args.output_args.quiet);
    let bytes_written = match format {
        DiskFormat::VhdFixed | DiskFormat::VhdDynamic => {
            write_output(&args.output, args.output_args.force, |out| {
                decode_vhd(&backend, out, &options, &mut progress).context("decode vhd")
            })?
            .bytes_written
        }
        DiskFormat::Sprs => {
            write_output(&args.output, args.output_args.force, |out| {
                decode_sprs(&backend, out, &mut progress).context("decode sprs")
            })?
            .bytes_written
        }
        DiskFormat::VhdDifferencing => {
            bail!("differencing VHDs need their parent chain and cannot be expanded")
        }
        DiskFormat::Raw => bail!(
            "{} is not a VHD or SPRS image (no footer cookie or magic found)",
            args.input.display()
        ),
    };

    info!(bytes_written, "wrote {}", args.output.display());
    Ok(())
}

fn to_sprs(args: ToSprsArgs) -> anyhow::Result<()> {
    let source = open_source(&args.input)?;
    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        total_sectors = source.total_sectors(),
        "encoding sprs image"
    );

    let mut progress = BarProgress::new(args.output_args.quiet);
    let summary = write_output(&args.output, args.output_args.force, |out| {
        encode_sprs(&source, out, &mut progress).context("encode sprs")
    })?;

    info!(
        stored_sectors = summary.stored_sectors,
        bytes_written = summary.bytes_written,
        "wrote {}",
        args.output.display()
    );
    Ok(())
}

/// `info` output. Absent fields are omitted from the JSON form.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoReport {
    format: &'static str,
    file_len: u64,
    disk_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    vhd: Option<VhdReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sprs: Option<SprsReport>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VhdReport {
    disk_type: String,
    unique_id: String,
    timestamp: u32,
    creator_app: String,
    creator_host_os: String,
    cylinders: u16,
    heads: u8,
    sectors_per_track: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_size_bytes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_blocks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    allocated_blocks: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SprsReport {
    total_sectors: u32,
    stored_sectors: u32,
}

impl From<&ImageInfo> for InfoReport {
    fn from(info: &ImageInfo) -> Self {
        let vhd = info.footer.as_ref().map(|footer| VhdReport {
            disk_type: footer.disk_type.to_string(),
            unique_id: footer.unique_id.to_string(),
            timestamp: footer.timestamp,
            creator_app: String::from_utf8_lossy(&footer.creator.app).into_owned(),
            creator_host_os: String::from_utf8_lossy(&footer.creator.host_os).into_owned(),
            cylinders: footer.geometry.cylinders,
            heads: footer.geometry.heads,
            sectors_per_track: footer.geometry.sectors_per_track,
            block_size_bytes: info.dynamic_header.as_ref().map(|h| h.block_size),
            total_blocks: info.total_blocks,
            allocated_blocks: info.allocated_blocks,
        });
        let sprs = info.sprs.map(|header| SprsReport {
            total_sectors: header.total_sectors,
            stored_sectors: header.entry_count,
        });
        Self {
            format: info.format.name(),
            file_len: info.file_len,
            disk_size_bytes: info.disk_size,
            vhd,
            sprs,
        }
    }
}

fn print_info(args: InfoArgs) -> anyhow::Result<()> {
    let backend = FileBackend::open_read_only(&args.input)
        .with_context(|| format!("open input {}", args.input.display()))?;
    let options = DecodeOptions {
        verify_checksums: !args.ignore_checksums,
    };
    let info = inspect(&backend, &options)
        .with_context(|| format!("inspect {}", args.input.display()))?;
    let report = InfoReport::from(&info);

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("serialize info")?;
        println!("{json}");
        return Ok(());
    }

    println!("format:       {}", report.format);
    println!("file size:    {} bytes", report.file_len);
    println!("disk size:    {} bytes", report.disk_size_bytes);
    if let Some(vhd) = &report.vhd {
        println!("disk type:    {}", vhd.disk_type);
        println!("unique id:    {}", vhd.unique_id);
        println!("creator:      {} ({})", vhd.creator_app, vhd.creator_host_os);
        println!(
            "geometry:     {}/{}/{} (c/h/s)",
            vhd.cylinders, vhd.heads, vhd.sectors_per_track
        );
        if let Some(block_size) = vhd.block_size_bytes {
            println!("block size:   {block_size} bytes");
        }
        if let (Some(total), Some(allocated)) = (vhd.total_blocks, vhd.allocated_blocks) {
            println!("blocks:       {allocated}/{total} allocated");
        }
    }
    if let Some(sprs) = &report.sprs {
        println!(
            "sectors:      {}/{} stored",
            sprs.stored_sectors, sprs.total_sectors
        );
    }
    Ok(())
}

/// Stream the converter output into a temporary file next to `output` and move it into place
/// only once `write` succeeds. A failed conversion leaves nothing behind.
fn write_output<T>(
    output: &Path,
    force: bool,
    write: impl FnOnce(&mut BufWriter<&mut File>) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    if output.exists() && !force {
        bail!(
            "output {} already exists (use --force to overwrite)",
            output.display()
        );
    }

    let dir = match output.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("create temporary file in {}", dir.display()))?;

    let result = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let result = write(&mut writer)?;
        writer
            .flush()
            .with_context(|| format!("flush {}", output.display()))?;
        result
    };
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync {}", output.display()))?;

    let persisted = if force {
        tmp.persist(output)
    } else {
        tmp.persist_noclobber(output)
    };
    persisted
        .map_err(|e| anyhow!(e.error))
        .with_context(|| format!("move output into place at {}", output.display()))?;
    Ok(result)
}

fn default_threads() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

fn validate_disk_size(label: &str, size_bytes: u64) -> anyhow::Result<()> {
    if size_bytes == 0 {
        bail!("{label} disk size must be non-zero");
    }
    if size_bytes % 512 != 0 {
        bail!("{label} disk size must be a multiple of 512 bytes (got {size_bytes})");
    }
    Ok(())
}

fn enforce_absurd_limits(
    disk_size_bytes: u64,
    block_size_bytes: u32,
    force: bool,
) -> anyhow::Result<()> {
    if force {
        return Ok(());
    }

    if disk_size_bytes > DEFAULT_ABSURD_DISK_SIZE_BYTES {
        bail!(
            "refusing to convert an extremely large disk ({} bytes > {} bytes); use --force to override",
            disk_size_bytes,
            DEFAULT_ABSURD_DISK_SIZE_BYTES
        );
    }

    let table_entries = disk_size_bytes.div_ceil(u64::from(block_size_bytes));
    let table_bytes = table_entries
        .checked_mul(4)
        .ok_or_else(|| anyhow!("allocation table size overflow"))?;
    if table_bytes > DEFAULT_ABSURD_TABLE_BYTES {
        bail!(
            "refusing to create a very large allocation table ({} bytes > {} bytes); use --force to override (or increase --block-size-bytes)",
            table_bytes,
            DEFAULT_ABSURD_TABLE_BYTES
        );
    }

    Ok(())
}

/// Renders converter progress as a byte-count bar on stderr.
struct BarProgress {
    quiet: bool,
    bar: Option<ProgressBar>,
}

impl BarProgress {
    fn new(quiet: bool) -> Self {
        Self { quiet, bar: None }
    }
}

impl Progress for BarProgress {
    fn begin(&mut self, phase: Phase, total_bytes: u64) {
        if self.quiet {
            return;
        }
        let bar = ProgressBar::new(total_bytes);
        let style = ProgressStyle::with_template(
            "{msg:>9} [{bar:40}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        )
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(phase.label());
        self.bar = Some(bar);
    }

    fn advance(&mut self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(bytes);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
