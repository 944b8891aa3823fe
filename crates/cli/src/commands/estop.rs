//! `cadence estop`: engage or release the emergency stop marker.
//!
//! A running `cadence run` polls the marker every stop quantum and stops
//! every session once it appears.

use cadence_safety::EstopMarker;

pub async fn run(resume: bool) -> Result<(), Box<dyn std::error::Error>> {
    apply(&EstopMarker::default_location(), resume)
}

fn apply(marker: &EstopMarker, resume: bool) -> Result<(), Box<dyn std::error::Error>> {
    if resume {
        if marker.release()? {
            println!("✅ Emergency stop RELEASED. Stopped sessions stay stopped until reset.");
        } else {
            println!("ℹ️  No emergency stop active.");
        }
        return Ok(());
    }

    if let Some(since) = marker.engaged_at().filter(|_| marker.is_engaged()) {
        println!("🛑 Emergency stop already engaged (since {since})");
        return Ok(());
    }

    marker.engage()?;
    println!("🛑 EMERGENCY STOP ENGAGED");
    println!("   Running sessions stop within one stop quantum.");
    println!("   New runs refuse to start.");
    println!();
    println!("   To resume: cadence estop --resume");
    Ok(())
}
