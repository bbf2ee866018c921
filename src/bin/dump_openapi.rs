use std::fs;

fn main() -> anyhow::Result<()> {
    let doc = case_authz::docs::build_openapi(case_authz::config::app_port())?;
    let s = serde_json::to_string_pretty(&doc)?;
    let path = std::env::args().nth(1).unwrap_or_else(|| "/tmp/case-authz-openapi.json".to_string());
    fs::write(&path, s)?;
    println!("wrote {}", path);
    Ok(())
}
