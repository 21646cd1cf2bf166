use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_describe_an_in_memory_deployment() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.to_string(), "127.0.0.1:8080");
    assert_eq!(settings.store.url, DEFAULT_STORE_URL);
    assert_eq!(settings.store.default_ttl, Duration::from_secs(300));
    assert!(settings.compression.enabled);
    assert_eq!(settings.compression.algorithm, CompressionAlgorithm::Gzip);
    assert_eq!(settings.compression.level, 6);
    assert_eq!(settings.compression.min_size_bytes, 1024);
    assert_eq!(settings.resilience.max_retries, 3);
    assert_eq!(settings.resilience.failure_threshold.get(), 5);
    assert_eq!(settings.resilience.breaker_timeout, Duration::from_secs(60));
    assert_eq!(settings.freshness.max_stale, Duration::from_secs(3600));
    assert_eq!(settings.prewarm.max_concurrency.get(), 3);
    assert_eq!(settings.rate_limit.window_seconds.get(), 60);
    assert_eq!(settings.rate_limit.max_requests.get(), 100);
    assert_eq!(settings.response_cache.invalidate_patterns, vec!["http:*"]);
    assert!(settings.origin.base_url.is_none());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rejects_unknown_store_scheme() {
    let mut raw = RawSettings::default();
    raw.store.url = Some("rediss://cache.internal".to_string());

    let err = Settings::from_raw(raw).expect_err("scheme should be rejected");
    assert!(matches!(err, LoadError::Invalid { key: "store.url", .. }));
}

#[test]
fn compression_level_is_checked_per_algorithm() {
    let mut raw = RawSettings::default();
    raw.compression.algorithm = Some("zstd".to_string());
    raw.compression.level = Some(19);
    let settings = Settings::from_raw(raw.clone()).expect("zstd accepts 19");
    assert_eq!(settings.compression.algorithm, CompressionAlgorithm::Zstd);

    raw.compression.algorithm = Some("gzip".to_string());
    let err = Settings::from_raw(raw).expect_err("gzip tops out at 9");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "compression.level",
            ..
        }
    ));
}

#[test]
fn zero_rate_limit_is_invalid() {
    let mut raw = RawSettings::default();
    raw.rate_limit.max_requests = Some(0);

    let err = Settings::from_raw(raw).expect_err("zero requests rejected");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "rate_limit.max_requests",
            ..
        }
    ));
}

#[test]
fn origin_url_is_normalised() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        origin_url: Some("https://api.example.com/".to_string()),
        ..Default::default()
    };
    raw.apply_serve_overrides(&overrides);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.origin.base_url.as_deref(),
        Some("https://api.example.com")
    );
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["feedcache"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "feedcache",
        "serve",
        "--store-url",
        "redis://localhost:6379",
        "--server-port",
        "9000",
        "--rate-limit-max-requests",
        "20",
        "--log-json",
        "yes",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            let overrides = &serve.overrides;
            assert_eq!(
                overrides.store.store_url.as_deref(),
                Some("redis://localhost:6379")
            );
            assert_eq!(overrides.server_port, Some(9000));
            assert_eq!(overrides.rate_limit_max_requests, Some(20));
            assert_eq!(overrides.log_json, Some(true));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn store_override_applies_to_maintenance_commands() {
    let args = CliArgs::parse_from([
        "feedcache",
        "invalidate",
        "--store-url",
        "redis://cache:6379",
        "--event",
        r#"{"event":"user_updated","userId":"u1"}"#,
    ]);

    let Some(Command::Invalidate(invalidate)) = args.command else {
        panic!("expected invalidate command");
    };
    let mut raw = RawSettings::default();
    raw.apply_store_override(&invalidate.store);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.store.url, "redis://cache:6379");
    assert!(invalidate.event.contains("user_updated"));
}
