use std::path::PathBuf;

use bpaf::{batteries::verbose_by_slice, construct, long, OptionParser, Parser};
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone)]
pub struct Options {
    pub verbosity_level: LevelFilter,
    pub config: Option<PathBuf>,
    pub frames: u64,
    pub workers: Option<usize>,
    pub agents: usize,
    pub snapshot: Option<PathBuf>,
}

pub fn options() -> OptionParser<Options> {
    let verbosity_level = verbose_by_slice(
        3,
        [
            LevelFilter::OFF,
            LevelFilter::ERROR,
            LevelFilter::WARN,
            LevelFilter::INFO,
            LevelFilter::DEBUG,
            LevelFilter::TRACE,
        ],
    );

    let config = long("config")
        .help("Reads the task system configuration from a JSON file")
        .argument::<PathBuf>("FILE")
        .complete_shell(bpaf::ShellComp::File {
            mask: Some("*.json"),
        })
        .optional();

    let frames = long("frames")
        .help("How many frames to simulate")
        .argument::<u64>("N")
        .fallback(300)
        .display_fallback();

    let workers = long("workers")
        .help("Overrides the amount of short task worker threads")
        .argument::<usize>("N")
        .optional();

    let agents = long("agents")
        .help("How many agents to update with the interval scheduler")
        .argument::<usize>("N")
        .fallback(64)
        .display_fallback();

    let snapshot = long("snapshot")
        .help("Periodically writes the simulation statistics into this file")
        .argument::<PathBuf>("FILE")
        .optional();

    construct!(Options {
        verbosity_level,
        config,
        frames,
        workers,
        agents,
        snapshot,
    })
    .to_options()
    .descr("Simulates frames of a game loop on top of the task system")
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::options;

    #[test]
    fn check_bpaf_invariants() {
        options().check_invariants(true);
    }

    #[test]
    fn defaults_and_overrides() {
        let no_args: &[&str] = &[];
        let defaults = options().run_inner(no_args).unwrap();
        assert_eq!(300, defaults.frames);
        assert_eq!(64, defaults.agents);
        assert_eq!(None, defaults.workers);
        assert_eq!(LevelFilter::INFO, defaults.verbosity_level);

        let custom = options()
            .run_inner(&["--frames", "10", "--workers", "2", "-v"][..])
            .unwrap();
        assert_eq!(10, custom.frames);
        assert_eq!(Some(2), custom.workers);
        assert_eq!(LevelFilter::DEBUG, custom.verbosity_level);
    }
}
