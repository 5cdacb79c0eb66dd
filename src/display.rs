use station_core::scheduler::StatusDisplay;

/// Status screen for boards without a panel: the lines go to the log
#[derive(Debug, Default)]
pub struct LogDisplay;

impl StatusDisplay for LogDisplay {
    fn show(&mut self, text: &str) {
        for line in text.lines() {
            log::info!("| {}", line);
        }
    }
}
