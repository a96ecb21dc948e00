use crate::cmd::open_store;
use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let recovered = open_store(root)?.recover_stuck_actors()?;
    if json {
        print_json(&serde_json::json!({ "recovered": recovered }))?;
    } else if recovered == 0 {
        println!("No stuck actors.");
    } else {
        println!("Moved {recovered} stuck actor(s) to failed.");
    }
    Ok(())
}
