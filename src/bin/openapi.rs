use anyhow::Result;

fn main() -> Result<()> {
    let doc = danmaku_verify::api::openapi();
    let json = serde_json::to_string_pretty(&doc)?;
    println!("{json}");
    Ok(())
}
