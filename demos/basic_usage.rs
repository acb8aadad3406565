//! Basic usage example for kairos timers

use kairos::{CancellationToken, Clock, Duration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let cancel_token = CancellationToken::new();
    let clock = Clock::new("example_clock".to_string(), cancel_token.clone())?;

    // Set multiple timers
    let timers = vec![
        ("short_timer", clock.new_timer(Duration::from_secs(1))),
        ("medium_timer", clock.new_timer(Duration::from_secs(2))),
        ("long_timer", clock.new_timer(Duration::from_secs(3))),
    ];
    println!("Timers set! Waiting for expiration...");

    let start = std::time::Instant::now();
    for (name, mut timer) in timers {
        if let Some(fired_at) = timer.recv().await {
            println!("Timer '{}' expired after {:?}", name, fired_at - start);
        }
    }

    // Let a timer fire without reading it, then reset it
    let mut timer = clock.new_timer(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Unread value buffered: {}", timer.is_ready());

    let reset_at = std::time::Instant::now();
    let was_active = timer.reset(Duration::from_millis(500))?;
    println!("Reset (was active: {}), buffered: {}", was_active, timer.is_ready());
    if let Some(fired_at) = timer.recv().await {
        println!("Reset timer fired after {:?}", fired_at - reset_at);
    }

    // Demonstrate cancellation
    let cancelled = clock.new_timer(Duration::from_secs(10));
    println!("Set a timer that will be cancelled...");
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Timer cancelled: {}", cancelled.stop()?);

    // Shutdown gracefully
    cancel_token.cancel();
    println!("Clock shut down successfully!");
    Ok(())
}
