//! Command line interface-related functionality.

use crate::settings::{self, Settings};
use crate::{BootstrapResult, ServiceInfo};
use clap::error::ErrorKind;
use clap::Command;
use std::ffi::OsString;

pub use clap::{Arg, ArgAction, ArgMatches};

const GENERATE_CONFIG_OPT_ID: &str = "generate";
const USE_CONFIG_OPT_ID: &str = "config";
const DRY_RUN_OPT_ID: &str = "dry-run";

/// A command line interface (CLI) helper that takes care of the command line
/// arguments parsing basics.
///
/// The service is configured primarily through its YAML [`Settings`]; the CLI
/// takes care of loading them and of generating a default configuration file.
///
/// The following command line options are provided:
///
/// - `-c`, `--config` - specifies an existing configuration file for the service.
/// - `-g`, `--generate` - generates a new default configuration file for the service.
/// - `--dry-run` - validates the configuration and exits without serving.
/// - `-h`, `--help` - prints CLI help information and exits.
/// - `-v`, `--version` - prints the service version and exits.
pub struct Cli {
    /// Parsed service settings.
    pub settings: Settings,

    /// Parsed service arguments.
    pub arg_matches: ArgMatches,
}

impl Cli {
    /// Bootstraps a new command line interface (CLI) for the service.
    ///
    /// The function will implicitly print relevant information and exit the
    /// process if `--help` or `--version` command line options are specified.
    pub fn new(service_info: &ServiceInfo) -> BootstrapResult<Self> {
        Self::new_from_os_args(service_info, std::env::args_os())
    }

    /// The same as [`Cli::new`], but accepts source OS arguments instead of
    /// taking them from [`std::env::args_os`]. Useful for testing purposes.
    pub fn new_from_os_args(
        service_info: &ServiceInfo,
        os_args: impl IntoIterator<Item = impl Into<OsString> + Clone>,
    ) -> BootstrapResult<Self> {
        let cmd = Command::new(service_info.name)
            .version(service_info.version)
            .author(service_info.author)
            .about(service_info.description)
            .arg(
                Arg::new(USE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("config")
                    .short('c')
                    .help("Specifies the config to run the service with"),
            )
            .arg(
                Arg::new(GENERATE_CONFIG_OPT_ID)
                    .action(ArgAction::Set)
                    .long("generate")
                    .short('g')
                    .help("Generates a new default config for the service"),
            )
            .arg(
                Arg::new(DRY_RUN_OPT_ID)
                    .action(ArgAction::SetTrue)
                    .long("dry-run")
                    .help("Validates the config and exits without serving"),
            );

        let arg_matches = get_arg_matches(cmd, os_args)?;
        let settings = get_settings(&arg_matches)?;

        Ok(Self {
            settings,
            arg_matches,
        })
    }

    /// Whether `--generate` was requested. The default config has already
    /// been written when this returns `true`.
    pub fn is_generate(&self) -> bool {
        self.arg_matches
            .get_one::<String>(GENERATE_CONFIG_OPT_ID)
            .is_some()
    }

    /// Whether `--dry-run` was requested.
    pub fn is_dry_run(&self) -> bool {
        self.arg_matches.get_flag(DRY_RUN_OPT_ID)
    }
}

fn get_arg_matches(
    cmd: Command,
    os_args: impl IntoIterator<Item = impl Into<OsString> + Clone>,
) -> BootstrapResult<ArgMatches> {
    cmd.try_get_matches_from(os_args).map_err(|e| {
        let kind = e.kind();

        // NOTE: print info and terminate the process
        if kind == ErrorKind::DisplayHelp || kind == ErrorKind::DisplayVersion {
            e.exit();
        }

        e.into()
    })
}

fn get_settings(arg_matches: &ArgMatches) -> BootstrapResult<Settings> {
    if let Some(path) = arg_matches.get_one::<String>(GENERATE_CONFIG_OPT_ID) {
        let settings = Settings::default();

        settings::to_yaml_file(&settings, path)?;

        return Ok(settings);
    }

    if let Some(path) = arg_matches.get_one::<String>(USE_CONFIG_OPT_ID) {
        return settings::from_file(path);
    }

    // NOTE: the service has a default configuration that works out of the
    // box, so a missing `--config` is not an error.
    Ok(Settings::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_info;

    #[test]
    fn defaults_without_config() {
        let cli = Cli::new_from_os_args(&service_info!(), ["promscope"]).unwrap();

        assert!(!cli.is_dry_run());
        assert_eq!(cli.settings, Settings::default());
    }

    #[test]
    fn generate_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("promscope.yaml");
        let path_str = path.to_str().unwrap().to_owned();

        let cli =
            Cli::new_from_os_args(&service_info!(), ["promscope", "--generate", &path_str])
                .unwrap();

        assert!(cli.is_generate());

        let reloaded: Settings = settings::from_file(&path_str).unwrap();

        assert_eq!(reloaded, Settings::default());
    }
}
