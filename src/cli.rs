//! Code related to CLI things
//!

use clap::{Arg, ArgAction, Command};

pub fn build_cli() -> Command {
    clap::command!()
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("configcheck")
                .long("configcheck")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("exportconfig")
                .long("export-config")
                .help("Print the default configuration as JSON and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("importzones")
                .long("import-zones")
                .value_name("FILE")
                .help("Import a JSON5 zone file and exit"),
        )
        .arg(
            Arg::new("zone")
                .long("zone")
                .value_name("NAME")
                .help("Restrict --import-zones / --export-zone to one zone"),
        )
        .arg(
            Arg::new("exportzone")
                .long("export-zone")
                .value_name("NAME")
                .help("Print a zone as JSON and exit"),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let matches = build_cli()
            .try_get_matches_from(["holdfast", "--config", "./test.json", "--configcheck"])
            .expect("parse");
        assert_eq!(
            matches.get_one::<String>("config").map(String::as_str),
            Some("./test.json")
        );
        assert!(matches.get_flag("configcheck"));
        assert!(!matches.get_flag("exportconfig"));
    }
}
