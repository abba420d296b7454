use crate::config::ImportConfig;
use crate::domain::model::ImportType;
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "fleet-import")]
#[command(about = "Bulk import of fleet users and vehicles from a GPS tracking provider")]
pub struct CliArgs {
    #[arg(short, long, default_value = "fleet-import.toml")]
    pub config: String,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,

    #[arg(long, help = "users-only | vehicles-only | complete-system | selective")]
    pub import_type: Option<ImportType>,

    #[arg(long, value_delimiter = ',', help = "Usernames for a selective import")]
    pub users: Vec<String>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long, help = "Restore the captured backup when the import fails")]
    pub rollback_on_failure: bool,

    #[arg(long, help = "Enable system monitoring")]
    pub monitor: bool,

    #[arg(long, help = "Validate the configuration and exit")]
    pub dry_run: bool,

    #[arg(long, help = "Write a JSON report to this path")]
    pub report: Option<String>,
}

impl CliArgs {
    /// 命令列參數覆寫設定檔
    pub fn apply_to(&self, config: &mut ImportConfig) {
        if let Some(import_type) = self.import_type {
            config.import.r#type = import_type;
        }
        if !self.users.is_empty() {
            config.import.selected_usernames = self.users.clone();
        }
        if let Some(batch_size) = self.batch_size {
            config.import.batch_size = batch_size;
        }
        if self.rollback_on_failure {
            config.import.rollback_on_failure = true;
        }
        if self.monitor {
            config.monitoring.enabled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let mut config = ImportConfig::from_toml_str(
            r#"
[provider]
base_url = "https://tracking.example.com"
principal = "fleet-admin"
secret = "s3cret"
"#,
        )
        .unwrap();

        let args = CliArgs::parse_from([
            "fleet-import",
            "--import-type",
            "selective",
            "--users",
            "driver01,driver02",
            "--batch-size",
            "10",
            "--monitor",
        ]);
        args.apply_to(&mut config);

        let options = config.import_options();
        assert_eq!(options.import_type, ImportType::Selective);
        assert_eq!(options.selected_usernames, vec!["driver01", "driver02"]);
        assert_eq!(options.batch_size, 10);
        assert!(config.monitoring.enabled);
        assert_eq!(args.config, "fleet-import.toml");
    }

    #[test]
    fn test_unknown_import_type_is_rejected() {
        assert!(CliArgs::try_parse_from(["fleet-import", "--import-type", "everything"]).is_err());
    }
}
