use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backdrop_agent::api::server::{serve, AppState};
use backdrop_agent::pipeline::agent::EXAMPLE_INSTRUCTIONS;
use backdrop_agent::pipeline::build_default_agent;
use backdrop_agent::pipeline::catalog::BackgroundCatalog;
use backdrop_agent::pipeline::compositor::encode_png;
use backdrop_agent::pipeline::runtime::default_app_root;
use backdrop_agent::pipeline::settings_layer::{
    load_agent_settings, AgentSettings, AgentSettingsOverlay,
};
use serde_json::json;
use tracing::level_filters::LevelFilter;
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> CliResult<()> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    let rest = cli_args.iter().skip(1).cloned().collect::<Vec<_>>();
    // Only `serve` needs an async runtime; the other subcommands block on
    // model and rembg subprocesses.
    match cli_args.first().map(String::as_str) {
        Some("edit") => run_edit_cli(rest),
        Some("plan") => run_plan_cli(rest),
        Some("backgrounds") => run_backgrounds_cli(rest),
        Some("serve") => run_serve_cli(rest),
        None => run_serve_cli(Vec::new()),
        Some("-h" | "--help") => {
            print_usage();
            Ok(())
        }
        Some(unknown) => Err(std::io::Error::other(format!(
            "Unknown command: {unknown}\n\nUse --help for usage."
        ))
        .into()),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct CommonCliArgs {
    app_root: Option<PathBuf>,
    settings_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EditCliArgs {
    common: CommonCliArgs,
    image: PathBuf,
    instruction: String,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PlanCliArgs {
    common: CommonCliArgs,
    instruction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct ServeCliArgs {
    common: CommonCliArgs,
    bind: Option<String>,
}

/// Flags shared by every subcommand plus whatever `extra` accepts. `extra`
/// returns `Ok(false)` for flags it does not know.
fn parse_flags(
    args: &[String],
    common: &mut CommonCliArgs,
    mut extra: impl FnMut(&str, String) -> CliResult<bool>,
) -> CliResult<()> {
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let Some(value) = args.get(i + 1).cloned() else {
            return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
        };
        match flag {
            "--app-root" => common.app_root = Some(PathBuf::from(value)),
            "--settings" => common.settings_path = Some(value),
            other => {
                if !extra(other, value)? {
                    return Err(std::io::Error::other(format!(
                        "Unknown argument: {other}\n\nUse --help for usage."
                    ))
                    .into());
                }
            }
        }
        i += 2;
    }
    Ok(())
}

fn required(value: Option<String>, flag: &str) -> CliResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| std::io::Error::other(format!("Missing required {flag}")).into())
}

fn parse_edit_cli_args(args: &[String]) -> CliResult<EditCliArgs> {
    let mut common = CommonCliArgs::default();
    let mut image = None::<String>;
    let mut instruction = None::<String>;
    let mut output = None::<String>;
    parse_flags(args, &mut common, |flag, value| {
        match flag {
            "--image" => image = Some(value),
            "--instruction" => instruction = Some(value),
            "--output" => output = Some(value),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    Ok(EditCliArgs {
        common,
        image: PathBuf::from(required(image, "--image")?),
        instruction: required(instruction, "--instruction")?,
        output: output
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
    })
}

fn parse_plan_cli_args(args: &[String]) -> CliResult<PlanCliArgs> {
    let mut common = CommonCliArgs::default();
    let mut instruction = None::<String>;
    parse_flags(args, &mut common, |flag, value| {
        if flag != "--instruction" {
            return Ok(false);
        }
        instruction = Some(value);
        Ok(true)
    })?;
    Ok(PlanCliArgs {
        common,
        instruction: required(instruction, "--instruction")?,
    })
}

fn parse_serve_cli_args(args: &[String]) -> CliResult<ServeCliArgs> {
    let mut common = CommonCliArgs::default();
    let mut bind = None::<String>;
    parse_flags(args, &mut common, |flag, value| {
        if flag != "--bind" {
            return Ok(false);
        }
        bind = Some(value);
        Ok(true)
    })?;
    Ok(ServeCliArgs { common, bind })
}

fn default_output_path(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|v| v.to_str())
        .unwrap_or("image");
    image.with_file_name(format!("{stem}_edited.png"))
}

fn load_settings(
    common: &CommonCliArgs,
    overrides: &AgentSettingsOverlay,
) -> CliResult<(PathBuf, AgentSettings)> {
    let app_root = common.app_root.clone().unwrap_or_else(default_app_root);
    let settings = load_agent_settings(
        app_root.as_path(),
        common.settings_path.as_deref(),
        overrides,
    )?;
    Ok((app_root, settings))
}

fn wants_help(args: &[String]) -> bool {
    args.iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
}

fn run_edit_cli(args: Vec<String>) -> CliResult<()> {
    if wants_help(args.as_slice()) {
        print_usage();
        return Ok(());
    }
    let parsed = parse_edit_cli_args(args.as_slice())?;
    let (app_root, settings) = load_settings(&parsed.common, &AgentSettingsOverlay::default())?;
    let image_bytes = std::fs::read(parsed.image.as_path()).map_err(|error| {
        std::io::Error::other(format!(
            "failed to read image '{}': {error}",
            parsed.image.display()
        ))
    })?;
    let catalog = BackgroundCatalog::scan(settings.backgrounds_dir.as_path())?;
    let agent = build_default_agent(app_root.as_path(), &settings);

    let outcome = agent.process(parsed.instruction.as_str(), image_bytes.as_slice(), &catalog);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "plan": outcome.plan,
            "plan_source": outcome.plan_source,
        }))?
    );
    for notice in &outcome.planning_log {
        println!("[plan] {notice}");
    }
    for entry in outcome.execution_log.entries() {
        println!("[exec] {entry}");
    }

    let Some(image) = outcome.final_image.as_ref() else {
        return Err(std::io::Error::other("No result image generated.").into());
    };
    let output = parsed
        .output
        .clone()
        .unwrap_or_else(|| default_output_path(parsed.image.as_path()));
    std::fs::write(output.as_path(), encode_png(image)?)?;
    println!("Saved {}", output.display());
    Ok(())
}

fn run_plan_cli(args: Vec<String>) -> CliResult<()> {
    if wants_help(args.as_slice()) {
        print_usage();
        return Ok(());
    }
    let parsed = parse_plan_cli_args(args.as_slice())?;
    let (app_root, settings) = load_settings(&parsed.common, &AgentSettingsOverlay::default())?;
    let catalog = BackgroundCatalog::scan(settings.backgrounds_dir.as_path())?;
    let agent = build_default_agent(app_root.as_path(), &settings);
    let analysis = agent.analyze_instruction(parsed.instruction.as_str(), &catalog);
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "plan": analysis.plan,
            "plan_source": analysis.source,
            "planning_log": analysis.notices,
        }))?
    );
    Ok(())
}

fn run_backgrounds_cli(args: Vec<String>) -> CliResult<()> {
    if wants_help(args.as_slice()) {
        print_usage();
        return Ok(());
    }
    let mut common = CommonCliArgs::default();
    parse_flags(args.as_slice(), &mut common, |_, _| Ok(false))?;
    let (_, settings) = load_settings(&common, &AgentSettingsOverlay::default())?;
    let catalog = BackgroundCatalog::scan(settings.backgrounds_dir.as_path())?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "backgrounds_dir": catalog.dir().display().to_string(),
            "count": catalog.len(),
            "backgrounds": catalog.entries(),
            "example_instructions": EXAMPLE_INSTRUCTIONS,
        }))?
    );
    Ok(())
}

fn run_serve_cli(args: Vec<String>) -> CliResult<()> {
    if wants_help(args.as_slice()) {
        print_usage();
        return Ok(());
    }
    let parsed = parse_serve_cli_args(args.as_slice())?;
    let overrides = AgentSettingsOverlay {
        bind: parsed.bind.clone(),
        ..AgentSettingsOverlay::default()
    };
    let (app_root, settings) = load_settings(&parsed.common, &overrides)?;
    let addr: SocketAddr = settings.bind.parse()?;
    info!(model = %settings.model_name, backgrounds_dir = %settings.backgrounds_dir.display(), "agent settings loaded");
    let agent = Arc::new(build_default_agent(app_root.as_path(), &settings));
    let state =
        AppState::new(agent, settings.backgrounds_dir).with_max_sessions(settings.max_sessions);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(addr, state))?;
    Ok(())
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  backdrop-agent edit --image PATH --instruction TEXT [--output PATH]\n",
            "  backdrop-agent plan --instruction TEXT\n",
            "  backdrop-agent backgrounds\n",
            "  backdrop-agent serve [--bind ADDR]\n\n",
            "Common flags:\n",
            "  --app-root PATH   defaults to the current directory\n",
            "  --settings PATH   defaults to config/agent.settings.toml (fallback: config/agent.settings.json)\n\n",
            "Environment overrides:\n",
            "  BACKDROP_BACKGROUNDS_DIR, BACKDROP_MODEL, BACKDROP_MODEL_BINARY,\n",
            "  BACKDROP_MODEL_TIMEOUT_SECS, BACKDROP_REMBG_PYTHON, BACKDROP_BIND,\n",
            "  BACKDROP_MAX_SESSIONS\n",
            "  RUST_LOG controls log verbosity (default: info)\n"
        )
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parse_edit_requires_image_and_instruction() {
        let err = parse_edit_cli_args(&args(&["--instruction", "make it blue"]))
            .expect_err("image should be required");
        assert!(err.to_string().contains("--image"));

        let err = parse_edit_cli_args(&args(&["--image", "cat.jpg", "--instruction", "  "]))
            .expect_err("blank instruction should be rejected");
        assert!(err.to_string().contains("--instruction"));
    }

    #[test]
    fn parse_edit_accepts_optional_flags() {
        let parsed = parse_edit_cli_args(&args(&[
            "--image",
            "photos/cat.jpg",
            "--instruction",
            "Make background gold",
            "--output",
            "out.png",
            "--settings",
            "custom.toml",
        ]))
        .expect("parse should succeed");
        assert_eq!(parsed.image, PathBuf::from("photos/cat.jpg"));
        assert_eq!(parsed.instruction, "Make background gold");
        assert_eq!(parsed.output, Some(PathBuf::from("out.png")));
        assert_eq!(parsed.common.settings_path.as_deref(), Some("custom.toml"));
    }

    #[test]
    fn parse_rejects_unknown_and_dangling_flags() {
        let err = parse_plan_cli_args(&args(&["--instruction", "x", "--bogus", "1"]))
            .expect_err("unknown flag should fail");
        assert!(err.to_string().contains("Unknown argument: --bogus"));

        let err = parse_serve_cli_args(&args(&["--bind"])).expect_err("missing value should fail");
        assert!(err.to_string().contains("Missing value for --bind"));
    }

    #[test]
    fn parse_serve_reads_bind() {
        let parsed = parse_serve_cli_args(&args(&["--bind", "0.0.0.0:9000"]))
            .expect("parse should succeed");
        assert_eq!(parsed.bind.as_deref(), Some("0.0.0.0:9000"));
    }

    #[test]
    fn backgrounds_subcommand_runs_outside_async_runtime() {
        assert!(tokio::runtime::Handle::try_current().is_err());
        let root = std::env::temp_dir().join(format!("backdrop_cli_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(root.as_path()).expect("app root");
        let app_root = root.display().to_string();

        run_backgrounds_cli(args(&["--app-root", app_root.as_str()]))
            .expect("backgrounds subcommand should succeed");
        assert!(root.join("backgrounds").is_dir());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn default_output_sits_next_to_input() {
        assert_eq!(
            default_output_path(Path::new("photos/cat.jpg")),
            PathBuf::from("photos/cat_edited.png")
        );
    }
}
