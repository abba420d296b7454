use clap::Parser;
use fleet_import::utils::error::ErrorSeverity;
use fleet_import::utils::{logger, validation::Validate};
use fleet_import::{
    CliArgs, HttpTrackingProvider, ImportConfig, ImportError, ImportOrchestrator,
    InMemoryJobStore, InMemoryRecordSink,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    // 初始化日誌
    if args.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(args.verbose);
    }

    tracing::info!("Starting fleet-import CLI");

    let mut config = match ImportConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => exit_with(&e),
    };
    args.apply_to(&mut config);
    if args.verbose {
        tracing::debug!("Import config: {:?}", config);
    }

    // 驗證配置
    if let Err(e) = config.validate() {
        tracing::error!("❌ Configuration validation failed: {}", e);
        tracing::error!("💡 Suggestion: {}", e.recovery_suggestion());
        exit_with(&e);
    }

    if args.dry_run {
        println!("✅ Configuration is valid: {}", args.config);
        return Ok(());
    }

    if config.monitoring.enabled {
        tracing::info!("🔍 System monitoring enabled");
    }

    let provider = match HttpTrackingProvider::new(&config.provider.base_url, config.request_timeout())
    {
        Ok(provider) => Arc::new(provider),
        Err(e) => exit_with(&e),
    };
    let store = Arc::new(InMemoryJobStore::new());
    let sink = Arc::new(InMemoryRecordSink::new());
    let orchestrator = Arc::new(
        ImportOrchestrator::new(provider, store.clone(), sink, config.orchestrator_config())
            .with_change_feed(store),
    );

    orchestrator.subscribe(|event| {
        println!(
            "📊 [{:>3}%] {} {:>3}% - {}",
            event.overall_progress, event.phase, event.phase_progress, event.current_operation
        );
    });

    // Ctrl-C 觸發取消並等待回滾完成
    let interrupt = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("🛑 Interrupt received, cancelling import");
                orchestrator.cancel_active("interrupted by user").await;
            }
        })
    };

    let options = config.import_options();
    tracing::info!("🚚 Starting {} import", options.import_type);
    let outcome = orchestrator.start_import(options).await;
    interrupt.abort();

    let summary = orchestrator.latest_error_summary();

    if let Some(path) = &args.report {
        let report = match &outcome {
            Ok(result) => serde_json::json!({
                "result": result,
                "job": orchestrator.job(&result.job_id),
                "rollback": orchestrator.rollback_report(&result.job_id),
                "summary": summary,
            }),
            Err(e) => serde_json::json!({
                "error": e.to_payload(),
                "summary": summary,
            }),
        };
        tokio::fs::write(path, serde_json::to_string_pretty(&report)?).await?;
        tracing::info!("📁 Report saved to: {}", path);
    }

    match outcome {
        Ok(result) => {
            tracing::info!("✅ Import {} completed", result.job_id);
            println!("✅ Import completed successfully!");
            println!(
                "👥 Users: {} imported, {} failed",
                result.counts.users.successful, result.counts.users.failed
            );
            println!(
                "🚗 Vehicles: {} imported, {} failed",
                result.counts.vehicles.successful, result.counts.vehicles.failed
            );
            if result.recovered_errors > 0 {
                println!("⚠️ Recovered errors: {}", result.recovered_errors);
                println!("{}", summary);
            }
        }
        Err(e) => {
            // 記錄詳細錯誤信息
            tracing::error!(
                "❌ Import failed: {} (Code: {}, Severity: {:?})",
                e,
                e.code(),
                e.severity()
            );
            tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
            eprintln!("{}", summary);
            exit_with(&e);
        }
    }

    Ok(())
}

/// 輸出用戶友好的錯誤信息，並依嚴重程度決定退出碼
fn exit_with(e: &ImportError) -> ! {
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());

    let exit_code = match e.severity() {
        ErrorSeverity::Low => 0,      // 警告，但成功
        ErrorSeverity::Medium => 2,   // 可重試
        ErrorSeverity::High => 1,     // 匯入失敗
        ErrorSeverity::Critical => 3, // 系統錯誤
    };
    std::process::exit(exit_code);
}
