use clap::Parser;
use std::path::PathBuf;

// Build version with target info
pub const VERSION_INFO: &str = const_format::concatcp!(
    env!("CARGO_PKG_VERSION"), "\n",
    "Target: ", std::env::consts::ARCH, "-", std::env::consts::OS
);

/// Pull frames through a demo filter graph and report scheduler behaviour
#[derive(Parser, Debug)]
#[command(author, version = VERSION_INFO, about, long_about = None)]
pub struct Args {
    /// Number of frames in the demo clip
    #[arg(short = 'n', long = "frames", value_name = "N", default_value_t = 100)]
    pub frames: i32,

    /// Frame width of the demo clip
    #[arg(long = "width", value_name = "PX", default_value_t = 640)]
    pub width: usize,

    /// Frame height of the demo clip
    #[arg(long = "height", value_name = "PX", default_value_t = 360)]
    pub height: usize,

    /// Worker threads (0 = number of logical CPUs, overrides config)
    #[arg(short = 't', long = "threads", value_name = "N")]
    pub threads: Option<usize>,

    /// Frame-buffer memory ceiling in MB (overrides config)
    #[arg(short = 'm', long = "mem", value_name = "MB")]
    pub mem_mb: Option<usize>,

    /// Request all frames up front with callbacks instead of one blocking call per frame
    #[arg(short = 'a', long = "async")]
    pub run_async: bool,

    /// Print the run report as JSON
    #[arg(short = 'j', long = "json")]
    pub json: bool,

    /// Load core configuration from a JSON file
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write log to file instead of stderr (default: framepull.log)
    #[arg(short = 'l', long = "log", value_name = "LOG_FILE")]
    pub log_file: Option<Option<PathBuf>>,

    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Args {
    /// Log level selected by `-v` count.
    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_flags() {
        let args = Args::parse_from(["framepull"]);
        assert_eq!(args.frames, 100);
        assert!(!args.run_async);
        assert!(args.threads.is_none());
        assert_eq!(args.log_level(), log::LevelFilter::Warn);

        let args = Args::parse_from(["framepull", "-n", "12", "-t", "3", "--async", "-vv", "-l"]);
        assert_eq!(args.frames, 12);
        assert_eq!(args.threads, Some(3));
        assert!(args.run_async);
        assert_eq!(args.log_level(), log::LevelFilter::Debug);
        assert_eq!(args.log_file, Some(None));
    }
}
