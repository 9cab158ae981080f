//! chainfix - apply chained fixups and slide info to Mach-O images.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use memmap2::Mmap;
use rayon::prelude::*;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use chainfix::fixup::chain::{chained_pointer_format, parse_header, walk_chains};
use chainfix::fixup::imports::parse_imports;
use chainfix::{
    apply_image_fixups, describe, FixupLocation, ImportEntry, LoadedImage, NullSigner,
    SymbolResolver, TableResolver,
};

/// Apply chained fixups and slide info to Mach-O images.
#[derive(Parser, Debug)]
#[command(name = "chainfix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, global = true, default_value = "1")]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dump the fixup chains and import table of an image
    Dump {
        /// Image to inspect
        image: PathBuf,

        /// Also report 32-bit non-pointer words found inside chains
        #[arg(long)]
        non_pointers: bool,

        /// Print only the import table
        #[arg(long)]
        imports_only: bool,
    },

    /// Apply fixups to images at a given slide, writing fixed-up copies
    Apply {
        /// Images to fix up
        images: Vec<PathBuf>,

        /// Slide to apply (hex, e.g. 0x4000)
        #[arg(short, long, default_value = "0")]
        slide: String,

        /// Define a bind target as NAME=ADDR (repeatable)
        #[arg(short, long)]
        define: Vec<String>,

        /// Bind unresolved imports to zero instead of failing
        #[arg(long)]
        bind_zero: bool,

        /// Output path (file for one image, directory for several)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Describe a slide-info blob
    SlideInfo {
        /// File holding the raw slide-info bytes
        blob: PathBuf,

        /// List per-page chain starts
        #[arg(long)]
        pages: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbosity);

    match cli.command {
        Commands::Dump {
            image,
            non_pointers,
            imports_only,
        } => cmd_dump(image, non_pointers, imports_only),
        Commands::Apply {
            images,
            slide,
            define,
            bind_zero,
            output,
            jobs,
        } => cmd_apply(images, &slide, &define, bind_zero, output, jobs),
        Commands::SlideInfo { blob, pages } => cmd_slide_info(blob, pages),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn parse_hex(s: &str) -> Result<u64> {
    let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(trimmed, 16).with_context(|| format!("Invalid hex value: {}", s))
}

/// Resolver binding every import to zero; used with --bind-zero to fix up
/// images whose dependencies are not at hand.
struct ZeroResolver<'a>(&'a TableResolver);

impl SymbolResolver for ZeroResolver<'_> {
    fn resolve(&self, import: &ImportEntry) -> Option<u64> {
        Some(self.0.resolve(import).unwrap_or(0))
    }
}

fn build_resolver(defines: &[String]) -> Result<TableResolver> {
    let mut resolver = TableResolver::new();
    for def in defines {
        let (name, addr) = def
            .split_once('=')
            .with_context(|| format!("Expected NAME=ADDR, got: {}", def))?;
        resolver.define(name, parse_hex(addr)?);
    }
    Ok(resolver)
}

fn cmd_dump(image_path: PathBuf, non_pointers: bool, imports_only: bool) -> Result<()> {
    let file = fs::File::open(&image_path)
        .with_context(|| format!("Failed to open: {}", image_path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    let image = chainfix::ImageContext::new(&mmap)
        .with_context(|| format!("Not a usable Mach-O image: {}", image_path.display()))?;

    let Some(format) = chained_pointer_format(&image)? else {
        println!("{}: no chained fixups", image_path.display());
        return Ok(());
    };
    println!("pointer format: {}", format.name());

    let blob = image.chained_fixups_data()?;
    let header = parse_header(blob)?;
    let imports = parse_imports(blob, &header)?;

    if !imports_only {
        let mut count = 0usize;
        walk_chains(&image, non_pointers, |loc: &FixupLocation| {
            count += 1;
            let kind = if loc.non_pointer {
                "nonptr"
            } else if loc.fixup.pointer.is_bind() {
                "bind  "
            } else {
                "rebase"
            };
            println!(
                "  seg {:2} page {:4} off {:#010x}  {}  raw {:#018x}",
                loc.segment, loc.page, loc.file_offset, kind, loc.raw
            );
            Ok(true)
        })?;
        println!("{} fixup locations", count);
    }

    println!("{} imports:", imports.len());
    for import in &imports {
        println!(
            "  [{:4}] {} from {}{}{}",
            import.ordinal,
            import.name,
            import.lib_description(),
            if import.weak_import { " (weak)" } else { "" },
            if import.addend != 0 {
                format!(" addend {:+}", import.addend)
            } else {
                String::new()
            }
        );
    }

    Ok(())
}

fn cmd_apply(
    images: Vec<PathBuf>,
    slide_str: &str,
    defines: &[String],
    bind_zero: bool,
    output: Option<PathBuf>,
    jobs: Option<usize>,
) -> Result<()> {
    if images.is_empty() {
        bail!("No input images given");
    }
    let start = Instant::now();
    let slide = parse_hex(slide_str)?;
    let table = build_resolver(defines)?;

    let apply_one = |input: &PathBuf, output_path: &PathBuf| -> Result<()> {
        let data = fs::read(input)
            .with_context(|| format!("Failed to read: {}", input.display()))?;
        let mut loaded = LoadedImage::map(&data)?;

        let counts = if bind_zero {
            apply_image_fixups(&mut loaded, slide, &ZeroResolver(&table), &NullSigner)?
        } else {
            apply_image_fixups(&mut loaded, slide, &table, &NullSigner)?
        };

        if !loaded.weak_missing().is_empty() {
            warn!(
                "{}: {} weak imports unresolved, bound to zero",
                input.display(),
                loaded.weak_missing().len()
            );
        }
        info!(
            "{}: {} rebases, {} binds",
            input.display(),
            counts.rebases,
            counts.binds
        );

        fs::write(output_path, loaded.into_image().as_bytes())
            .with_context(|| format!("Failed to write: {}", output_path.display()))?;
        Ok(())
    };

    // Single image
    if images.len() == 1 {
        let input = &images[0];
        let output_path = output.unwrap_or_else(|| input.with_extension("fixed"));
        apply_one(input, &output_path)?;
        info!(
            "Fixed up {} in {:.2}s",
            output_path.display(),
            start.elapsed().as_secs_f64()
        );
        return Ok(());
    }

    // Batch: fix up in parallel into an output directory
    let output_dir = output.unwrap_or_else(|| PathBuf::from("fixed"));
    fs::create_dir_all(&output_dir)?;

    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let progress = ProgressBar::new(images.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .unwrap()
            .progress_chars("#>-"),
    );

    let errors: Vec<_> = images
        .par_iter()
        .filter_map(|input| {
            let name = input.file_name().map(PathBuf::from).unwrap_or_default();
            let output_path = output_dir.join(name);
            let result = apply_one(input, &output_path);
            progress.inc(1);
            result.err().map(|e| (input.clone(), e))
        })
        .collect();

    progress.finish_with_message("Done");

    if !errors.is_empty() {
        warn!("{} images failed:", errors.len());
        for (path, err) in &errors {
            error!("  {}: {:#}", path.display(), err);
        }
    }

    info!(
        "Fixed up {}/{} images in {:.2}s",
        images.len() - errors.len(),
        images.len(),
        start.elapsed().as_secs_f64()
    );

    Ok(())
}

fn cmd_slide_info(blob_path: PathBuf, pages: bool) -> Result<()> {
    let file = fs::File::open(&blob_path)
        .with_context(|| format!("Failed to open: {}", blob_path.display()))?;
    let mmap = unsafe { Mmap::map(&file)? };

    let description = describe(&mmap)
        .with_context(|| format!("Unreadable slide info: {}", blob_path.display()))?;
    println!("{}", description);

    if pages {
        for page in chainfix::dyld::slide::page_descriptors(&mmap)? {
            let starts: Vec<String> = page
                .chain_starts
                .iter()
                .map(|s| format!("{:#x}", s))
                .collect();
            println!("  page {:5}: {}", page.page_index, starts.join(", "));
        }
    }

    Ok(())
}
