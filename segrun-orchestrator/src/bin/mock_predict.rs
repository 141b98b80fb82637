//! Stand-in for `nnUNetv2_predict`
//!
//! Accepts the same `-i -o -d -c -f` arguments, prints progress the way the
//! real predictor does (bars redrawn with `\r`) and writes placeholder
//! segmentations. Point `SEGRUN_INFERENCE_EXE` at it to exercise the
//! orchestrator without a GPU.
//!
//! The first input file may contain a marker that changes the behaviour:
//! - `MOCK:error` prints a traceback and exits with status 1
//! - `MOCK:hang` announces the case and then sleeps
//! - `MOCK:no-output` runs normally but writes nothing
//! - `MOCK:slow` stretches the progress output

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;

const PLACEHOLDER: &[u8] = b"FAKE_NIFTI_DATA";

#[derive(Parser, Debug)]
#[command(name = "mock-nnunet-predict")]
#[command(about = "Mock nnUNetv2_predict for testing", long_about = None)]
struct Args {
    /// Input folder
    #[arg(short = 'i', long = "input")]
    input: PathBuf,

    /// Output folder
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Dataset name or id
    #[arg(short = 'd', long = "dataset", default_value = "101")]
    dataset: String,

    /// Configuration
    #[arg(short = 'c', long = "config", default_value = "3d_fullres")]
    config: String,

    /// Folds
    #[arg(short = 'f', long = "folds", num_args = 1.., default_value = "0")]
    folds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behaviour {
    Normal,
    Error,
    Hang,
    NoOutput,
    Slow,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let files = match list_inputs(&args.input) {
        Ok(files) => files,
        Err(e) => {
            eprintln!("Error: cannot read input folder {}: {}", args.input.display(), e);
            return ExitCode::from(2);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&args.output) {
        eprintln!("Error: cannot create output folder {}: {}", args.output.display(), e);
        return ExitCode::from(2);
    }

    let behaviour = files
        .first()
        .map(|f| behaviour_of(f))
        .unwrap_or(Behaviour::Normal);

    println!(
        "Using dataset {} with configuration {} and folds {}",
        args.dataset,
        args.config,
        args.folds.join(",")
    );

    let step = match behaviour {
        Behaviour::Slow => Duration::from_millis(200),
        _ => Duration::from_millis(10),
    };

    let per_case = files.iter().any(|f| file_name(f).starts_with("case_"));
    let result = if per_case {
        run_case(&args.output, behaviour, step)
    } else {
        run_batch(&files, &args.output, behaviour, step)
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(2)
        }
    }
}

fn run_case(output: &Path, behaviour: Behaviour, step: Duration) -> std::io::Result<ExitCode> {
    println!("Predicting case:");
    println!("preprocessing done, starting sliding window prediction");

    match behaviour {
        Behaviour::Error => return Ok(fail()),
        Behaviour::Hang => {
            std::io::stdout().flush()?;
            loop {
                sleep(Duration::from_secs(3600));
            }
        }
        _ => {}
    }

    progress(20, step)?;
    println!("resampling and exporting segmentation");
    println!("done with case");

    if behaviour != Behaviour::NoOutput {
        std::fs::write(output.join("prediction.nii.gz"), PLACEHOLDER)?;
    }
    Ok(ExitCode::SUCCESS)
}

fn run_batch(
    files: &[PathBuf],
    output: &Path,
    behaviour: Behaviour,
    step: Duration,
) -> std::io::Result<ExitCode> {
    if behaviour == Behaviour::Error {
        return Ok(fail());
    }

    let total = files.len();
    let mut out = std::io::stdout();
    for (index, file) in files.iter().enumerate() {
        for pct in (0..=100).step_by(20) {
            write!(out, "{}% processing {}/{}\r", pct, index + 1, total)?;
            out.flush()?;
            sleep(step);
        }
        if behaviour != Behaviour::NoOutput {
            let name = file_name(file);
            let stem = name
                .strip_suffix(".nii.gz")
                .or_else(|| name.strip_suffix(".nii"))
                .unwrap_or(&name);
            std::fs::write(output.join(format!("{}.nii.gz", stem)), PLACEHOLDER)?;
        }
    }
    writeln!(out, "\nBatch Done")?;
    Ok(ExitCode::SUCCESS)
}

fn progress(steps: u32, step: Duration) -> std::io::Result<()> {
    let mut out = std::io::stdout();
    for i in 0..=steps {
        let pct = i * 100 / steps;
        write!(out, "{:3}%|########| step {}/{}\r", pct, i, steps)?;
        out.flush()?;
        sleep(step);
    }
    writeln!(out)?;
    Ok(())
}

fn fail() -> ExitCode {
    eprintln!("Traceback (most recent call last):");
    eprintln!("  File \"predict_from_raw_data.py\", line 42, in predict");
    eprintln!("RuntimeError: mock inference failure");
    ExitCode::from(1)
}

fn behaviour_of(file: &Path) -> Behaviour {
    let content = std::fs::read(file).unwrap_or_default();
    let text = String::from_utf8_lossy(&content);
    if text.contains("MOCK:error") {
        Behaviour::Error
    } else if text.contains("MOCK:hang") {
        Behaviour::Hang
    } else if text.contains("MOCK:no-output") {
        Behaviour::NoOutput
    } else if text.contains("MOCK:slow") {
        Behaviour::Slow
    } else {
        Behaviour::Normal
    }
}

fn list_inputs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            let lower = file_name(p).to_ascii_lowercase();
            lower.ends_with(".nii") || lower.ends_with(".nii.gz")
        })
        .collect();
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}
