use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use imgcmp::{CliArgs, DerivedParams, Device, FrameStats};

fn main() {
    let args = Cli::parse();
    init_tracing(args.verbose);
    handle_compare(args);
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn handle_compare(args: Cli) {
    let cli_args = CliArgs {
        reference_path: args.reference.clone(),
        candidate_path: args.candidate.clone(),
        output_path: args.output.clone(),
        field_of_view_degrees: args.fov,
        color_factor: args.color_factor,
        device: args.device,
        output_format: args.format.clone(),
        dry_run: args.dry_run,
        explain: args.explain,
    };

    let params = match imgcmp::build_params(cli_args) {
        Ok(params) => params,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    };

    if params.dry_run {
        match imgcmp::dry_run(&params) {
            Ok(derived) => {
                println!("{:#?}", params);
                print_derived(&derived);
            }
            Err(err) => {
                eprintln!("error: {err}");
                std::process::exit(1);
            }
        }
        return;
    }

    match imgcmp::compare(&params) {
        Ok(stats) => {
            print_stats(&stats, &params.output_path);
            if params.explain {
                print_derived(&stats.derived);
            }
        }
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "imgcmp",
    bin_name = "imgcmp",
    version,
    about = "Map where two images differ visibly to a human observer.",
    arg_required_else_help = true
)]
struct Cli {
    /// Reference image
    #[arg(value_name = "REFERENCE", help_heading = "REQUIRED")]
    reference: PathBuf,

    /// Candidate image, same size as the reference
    #[arg(value_name = "CANDIDATE", help_heading = "REQUIRED")]
    candidate: PathBuf,

    /// Output path for the 8-bit visibility map
    #[arg(
        short,
        long,
        value_name = "OUTPUT",
        required = true,
        help_heading = "REQUIRED"
    )]
    output: PathBuf,

    #[arg(
        long,
        value_name = "DEG",
        default_value = "45.0",
        value_parser = parse_f64,
        help_heading = "VIEWING",
        help = "Horizontal field of view in degrees (0.1 < DEG < 89.9)"
    )]
    fov: f64,

    #[arg(
        long = "color-factor",
        value_name = "F",
        default_value = "1.0",
        value_parser = parse_f64,
        help_heading = "VIEWING",
        help = "Output scale in [0, 1]"
    )]
    color_factor: f64,

    #[arg(
        long,
        value_name = "DEVICE",
        value_enum,
        default_value_t = Device::Cpu,
        help_heading = "DEVICE",
        help = "'cpu' | 'gpu'"
    )]
    device: Device,

    #[arg(
        long,
        value_name = "EXT",
        help_heading = "I/O",
        help = "Force output format by extension (png/tif/bmp) [default: from path]"
    )]
    format: Option<String>,

    #[arg(
        long,
        help_heading = "I/O",
        help = "Validate inputs and print derived parameters; no comparison"
    )]
    dry_run: bool,

    #[arg(
        long,
        help_heading = "I/O",
        help = "Print derived viewing parameters after comparing"
    )]
    explain: bool,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn print_stats(stats: &FrameStats, output: &Path) {
    println!(
        "compared {}x{} → {}: max {:.3}, mean {:.4}, {:.2}% visible",
        stats.width,
        stats.height,
        output.display(),
        stats.max_visibility,
        stats.mean_visibility,
        stats.visible_fraction * 100.0
    );
}

fn print_derived(derived: &DerivedParams) {
    println!(
        "fov {:.2}°, one-degree pixels {:.3}, {:.3} px/deg, adaptation level {}",
        derived.field_of_view_degrees,
        derived.num_one_degree_pixels,
        derived.pixels_per_degree,
        derived.adaptation_level
    );
    for (band, cpd) in derived.cpd.iter().enumerate() {
        match derived.band_threshold(band) {
            Some(frq) => println!("  band {band}: {cpd:.4} cpd, threshold {frq:.4}"),
            None => println!("  band {band}: {cpd:.4} cpd, no threshold"),
        }
    }
}

fn parse_f64(arg: &str) -> Result<f64, String> {
    arg.parse()
        .map_err(|err| format!("invalid number: {err}"))
}
