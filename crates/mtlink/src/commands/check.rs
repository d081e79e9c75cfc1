//! `mtlink check`: validate configuration.

use anyhow::{Result, bail};
use serde::Serialize;

use mtlink::config::Config;
use mtlink::transport::rpc::LAYER;

#[derive(Debug, Serialize)]
struct Summary {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    api_layer: i32,
    session_home: String,
    default_addr: String,
    use_ipv6: bool,
    data_centers: Vec<(i32, String)>,
    request_timeout_seconds: u64,
    bind_wait_timeout_seconds: u64,
}

impl Summary {
    fn new(config: &Config) -> Self {
        let error = config.check().err().map(|e| e.to_string());
        let mut data_centers: Vec<(i32, String)> = config
            .data_centers
            .addresses
            .iter()
            .map(|(dc, addr)| (*dc, addr.clone()))
            .collect();
        data_centers.sort();

        Self {
            valid: error.is_none(),
            error,
            api_layer: LAYER,
            session_home: config.session_home.display().to_string(),
            default_addr: config.data_centers.default_addr.clone(),
            use_ipv6: config.data_centers.use_ipv6,
            data_centers,
            request_timeout_seconds: config.manager.request_timeout_seconds,
            bind_wait_timeout_seconds: config.manager.bind_wait_timeout_seconds,
        }
    }

    fn print_text(&self) {
        println!("mtlink configuration");
        println!("{}", "=".repeat(40));
        println!("API layer:        {}", self.api_layer);
        println!("Session home:     {}", self.session_home);
        println!("Default address:  {}", self.default_addr);
        println!("IPv6:             {}", self.use_ipv6);
        println!("Request timeout:  {}s", self.request_timeout_seconds);
        println!("Bind wait:        {}s", self.bind_wait_timeout_seconds);
        println!("Data centers:");
        for (dc, addr) in &self.data_centers {
            println!("  {dc:>3}  {addr}");
        }
        println!();
        match &self.error {
            None => println!("Configuration is valid."),
            Some(e) => println!("Configuration is invalid: {e}"),
        }
    }
}

pub async fn run(config_path: &str, format: &str) -> Result<()> {
    let config = super::load_config(config_path).await?;
    let summary = Summary::new(&config);

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
        "text" => summary.print_text(),
        other => bail!("unknown format '{other}' (expected 'text' or 'json')"),
    }

    if let Some(e) = summary.error {
        bail!("{e}");
    }
    Ok(())
}
