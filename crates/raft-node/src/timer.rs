//! # timer
//!
//! why: randomized election timeout the event loop can restart or park
//! relations: fires Event::ElectionTimeout into node.rs; reset by vote grants and valid heartbeats
//! what: TimerCommand, ElectionTimer handle and its task

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::node::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Start a fresh random timeout
    Reset,
    /// Park until the next Reset
    Stop,
}

/// Handle to the timer task. Commands are fire-and-forget.
#[derive(Debug)]
pub struct ElectionTimer {
    commands: mpsc::UnboundedSender<TimerCommand>,
    task: JoinHandle<()>,
}

impl ElectionTimer {
    /// Spawn the timer, already running
    pub(crate) fn spawn(range: (Duration, Duration), events: mpsc::UnboundedSender<Event>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(range, rx, events));
        Self { commands, task }
    }

    pub fn reset(&self) {
        let _ = self.commands.send(TimerCommand::Reset);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(TimerCommand::Stop);
    }
}

impl Drop for ElectionTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn random_timeout((min, max): (Duration, Duration)) -> Duration {
    let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(ms as u64)
}

async fn run(
    range: (Duration, Duration),
    mut commands: mpsc::UnboundedReceiver<TimerCommand>,
    events: mpsc::UnboundedSender<Event>,
) {
    let mut parked = false;
    loop {
        if parked {
            match commands.recv().await {
                Some(TimerCommand::Reset) => parked = false,
                Some(TimerCommand::Stop) => {}
                None => return,
            }
            continue;
        }

        let timeout = random_timeout(range);
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if events.send(Event::ElectionTimeout).is_err() {
                    return;
                }
            }
            command = commands.recv() => match command {
                Some(TimerCommand::Reset) => {}
                Some(TimerCommand::Stop) => parked = true,
                None => return,
            },
        }
    }
}
