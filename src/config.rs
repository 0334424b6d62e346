use clap::Parser;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "runbox", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: String,

    /// Whether to flush the existing database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file
    pub fn to_config(&self) -> std::io::Result<Config> {
        let file = std::fs::File::open(&self.config_path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    pub languages: Vec<LanguageConfig>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

/// Pipeline capacity and default resource ceilings. Per-request constraints
/// are filled from the defaults when absent and clamped to the maxima.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_queue_size: usize,
    pub max_concurrent_sandboxes: u8,
    pub callback_max_attempts: u32,
    /// CPU time limit in seconds applied when a request carries none
    pub default_time_limit: f64,
    pub max_time_limit: f64,
    /// Added on top of the time limit to form the hard wall-clock ceiling,
    /// so a runaway process can never block a worker indefinitely
    pub wall_time_margin: f64,
    /// Memory ceiling in KB
    pub default_memory_limit: u64,
    pub max_memory_limit: u64,
    /// Stack ceiling in KB
    pub default_stack_limit: u64,
    pub default_max_processes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_concurrent_sandboxes: 2,
            callback_max_attempts: 3,
            default_time_limit: 5.0,
            max_time_limit: 15.0,
            wall_time_margin: 1.0,
            default_memory_limit: 128_000,
            max_memory_limit: 512_000,
            default_stack_limit: 64_000,
            default_max_processes: 60,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_callbacks: bool,
    pub enable_compiler_options: bool,
    pub enable_command_line_arguments: bool,
    pub enable_additional_files: bool,
    pub enable_network: bool,
    pub enable_wait: bool,
    pub enable_delete: bool,
    pub maintenance_mode: bool,
    /// Language name prefixes for which compiler options are accepted
    pub compiler_options_allowed_languages: Vec<String>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_callbacks: true,
            enable_compiler_options: true,
            enable_command_line_arguments: true,
            enable_additional_files: true,
            enable_network: false,
            enable_wait: true,
            enable_delete: false,
            maintenance_mode: false,
            compiler_options_allowed_languages: vec![
                "C".to_string(),
                "C++".to_string(),
                "Rust".to_string(),
                "Go".to_string(),
            ],
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct LanguageConfig {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_archived: bool,
    /// Project languages take their sources from the additional-files archive
    /// instead of the `source_code` field
    #[serde(default)]
    pub is_project: bool,
    pub source_file: String,
    /// Command templates use `%SOURCE%` and `%EXECUTABLE%` placeholders
    pub compile_cmd: Option<Vec<String>>,
    pub run_cmd: Vec<String>,
}

impl LanguageConfig {
    pub fn is_compiled(&self) -> bool {
        self.compile_cmd.is_some()
    }
}
