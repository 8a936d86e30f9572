#![forbid(unsafe_code)]

use std::path::PathBuf;

use ft_api::FrankenTorchSession;
use ft_core::{DType, ExecutionMode};
use ft_device::DeviceProfile;
use ft_estimate::{EstimateMode, EstimatorConfig, RuntimeEstimator};
use ft_nn::{Module, mlp};

const USAGE: &str = "usage: estimate_mlp [--mode operator-level-benchmark|operator-level-cost-model|operator-level-learned-model] [--device a100|h100|profile.json] [--config config.json] [--predictors dir] [--batch N] [--depth N] [--json]";

fn main() -> Result<(), String> {
    let mut mode: Option<EstimateMode> = None;
    let mut device: Option<String> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut predictors: Option<PathBuf> = None;
    let mut batch = 32usize;
    let mut depth = 2usize;
    let mut emit_json = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mode" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--mode requires an estimate mode name".to_string())?;
                mode = Some(value.parse::<EstimateMode>().map_err(|error| format!("{error}"))?);
            }
            "--device" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--device requires a preset name or a profile path".to_string())?;
                device = Some(value);
            }
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a file path".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--predictors" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--predictors requires a directory".to_string())?;
                predictors = Some(PathBuf::from(value));
            }
            "--batch" => batch = parse_count(args.next(), "--batch")?,
            "--depth" => depth = parse_count(args.next(), "--depth")?,
            "--json" => emit_json = true,
            other => return Err(format!("unknown arg '{other}'. {USAGE}")),
        }
    }

    let mut config = match config_path {
        Some(path) => EstimatorConfig::load(&path).map_err(|error| error.to_string())?,
        None => EstimatorConfig::default(),
    };
    if let Some(mode) = mode {
        config.mode = mode;
    }
    if let Some(device) = device {
        config.device = Some(resolve_device(&device)?);
    }
    if let Some(root) = predictors {
        config.predictor_root = root;
    }
    let config = config.apply_env();

    let mut session = FrankenTorchSession::new(ExecutionMode::Symbolic);
    let model = mlp(&mut session, "model", [512, 1024, 256], DType::F32)
        .map_err(|error| format!("failed to build model: {error}"))?;
    let input = session
        .randn(vec![batch, 512], DType::F32)
        .map_err(|error| format!("failed to create input: {error}"))?;

    let mut estimator = RuntimeEstimator::new(config).map_err(|error| error.to_string())?;
    let ((), summary) = estimator
        .run(&mut session, |session| {
            let output = model.forward(session, &input)?;
            let grad = session.ones(output.meta().shape().to_vec(), DType::F32)?;
            model.backward(session, &grad)?;
            Ok(())
        })
        .map_err(|error| format!("estimation failed: {error}"))?;
    let report = estimator
        .report()
        .ok_or_else(|| "estimator produced no report".to_string())?;

    if emit_json {
        let json = report
            .to_json()
            .map_err(|error| format!("failed to serialize report: {error}"))?;
        println!("{json}");
        return Ok(());
    }
    println!("{summary}");
    report
        .display_scope_stats(depth)
        .map_err(|error| format!("failed to write stats: {error}"))
}

fn parse_count(value: Option<String>, flag: &str) -> Result<usize, String> {
    let value = value.ok_or_else(|| format!("{flag} requires a positive integer"))?;
    value
        .parse::<usize>()
        .ok()
        .filter(|count| *count > 0)
        .ok_or_else(|| format!("{flag} expects a positive integer, got '{value}'"))
}

fn resolve_device(raw: &str) -> Result<DeviceProfile, String> {
    match DeviceProfile::named(raw) {
        Some(profile) => Ok(profile),
        None => DeviceProfile::load(PathBuf::from(raw).as_path()).map_err(|error| error.to_string()),
    }
}
