//! Watermark inspection tool
//!
//! Recovers forensic payloads from leaked images and, with a ledger,
//! reports who the copy was issued to.
//!
//! Usage:
//!   wm-inspect [--methods <list>] [--ledger <db>] <image>...
//!   wm-inspect --reference <original> --candidates <id,...> <image>...
//!
//! One JSON object is printed per image.

use std::path::{Path, PathBuf};

use content_shield::watermark::{SqliteLedger, WatermarkCodec, WatermarkId, WatermarkLedger, WatermarkMethod};
use serde_json::{json, Value};

/// Command line arguments
struct Args {
    images: Vec<PathBuf>,
    methods: Option<Vec<WatermarkMethod>>,
    ledger: Option<PathBuf>,
    reference: Option<PathBuf>,
    candidates: Vec<WatermarkId>,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = std::env::args().skip(1);
        let mut images = Vec::new();
        let mut methods = None;
        let mut ledger = None;
        let mut reference = None;
        let mut candidates = Vec::new();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--methods" | "-m" => {
                    let list = args.next().ok_or("--methods needs a list")?;
                    methods = Some(
                        list.split(',')
                            .map(|m| m.trim().parse::<WatermarkMethod>())
                            .collect::<Result<Vec<_>, _>>()?,
                    );
                }
                "--ledger" | "-l" => {
                    ledger = Some(args.next().map(PathBuf::from).ok_or("--ledger needs a path")?);
                }
                "--reference" | "-r" => {
                    reference = Some(args.next().map(PathBuf::from).ok_or("--reference needs a path")?);
                }
                "--candidates" => {
                    let list = args.next().ok_or("--candidates needs a list")?;
                    for raw in list.split(',') {
                        let id = WatermarkId::from_hex(raw.trim())
                            .ok_or_else(|| format!("Invalid watermark id: {}", raw))?;
                        candidates.push(id);
                    }
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                flag if flag.starts_with('-') => {
                    return Err(format!("Unknown argument: {}", flag));
                }
                _ => images.push(PathBuf::from(arg)),
            }
        }

        if images.is_empty() {
            return Err("at least one image is required".to_string());
        }
        if !candidates.is_empty() && reference.is_none() {
            return Err("--candidates requires --reference".to_string());
        }

        Ok(Self {
            images,
            methods,
            ledger,
            reference,
            candidates,
        })
    }
}

fn print_help() {
    println!(
        r#"wm-inspect - recover forensic watermarks

USAGE:
    wm-inspect [OPTIONS] <IMAGE>...

OPTIONS:
    -m, --methods <LIST>        Extraction methods, comma separated
                                (steganographic, metadata, pixel_perturbation, frequency_blocks)
    -l, --ledger <PATH>         SQLite watermark ledger to resolve recovered ids
    -r, --reference <PATH>      Unmarked original for pattern tracing
        --candidates <IDS>      Watermark ids (hex) to score against the reference
    -h, --help                  Print help information"#
    );
}

#[tokio::main]
async fn main() {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let codec = match args.methods {
        Some(methods) => WatermarkCodec::new(methods),
        None => WatermarkCodec::default(),
    };
    let ledger = match &args.ledger {
        Some(path) => Some(SqliteLedger::open(path.clone()).await?),
        None => None,
    };
    let reference = match &args.reference {
        Some(path) => Some(std::fs::read(path)?),
        None => None,
    };

    for path in &args.images {
        let report = inspect(&codec, ledger.as_ref(), reference.as_deref(), &args.candidates, path).await;
        println!("{}", report);
    }
    Ok(())
}

async fn inspect(
    codec: &WatermarkCodec,
    ledger: Option<&SqliteLedger>,
    reference: Option<&[u8]>,
    candidates: &[WatermarkId],
    path: &Path,
) -> Value {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => return json!({ "file": path, "error": e.to_string() }),
    };

    let mut report = json!({ "file": path });

    match codec.extract(&bytes) {
        Ok(Some(extraction)) => {
            report["method"] = json!(extraction.method);
            report["payload"] = json!(extraction.payload);
            if let Some(ledger) = ledger {
                report["record"] = match ledger.find(&extraction.payload.watermark_id).await {
                    Ok(record) => json!(record),
                    Err(e) => json!({ "error": e.to_string() }),
                };
            }
        }
        Ok(None) => report["payload"] = Value::Null,
        Err(e) => report["error"] = json!(e.to_string()),
    }

    if let (Some(reference), false) = (reference, candidates.is_empty()) {
        report["trace"] = match codec.trace(&bytes, reference, candidates) {
            Ok(matches) => Value::Array(
                matches
                    .iter()
                    .map(|m| {
                        json!({
                            "watermark_id": m.watermark_id,
                            "pixel_score": m.pixel_score,
                            "frequency_score": m.frequency_score,
                            "match": m.is_match(),
                        })
                    })
                    .collect(),
            ),
            Err(e) => json!({ "error": e.to_string() }),
        };
    }

    report
}
