use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::queue::JobState;
use crate::source::SourceProgress;

/// Периодическое обновление прогресса задачи.
///
/// Ядро пересылает такие события с настроенным интервалом, независимо от
/// того, как часто источник сообщает о прогрессе.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Прогресс в процентах (0-100)
    pub percent: u8,
    /// Скачано байт (опционально)
    pub bytes_done: Option<u64>,
    /// Общий размер в байтах (опционально)
    pub bytes_total: Option<u64>,
    /// Скорость загрузки в байтах/с (опционально)
    pub speed_bytes_sec: Option<f64>,
    /// Оценка оставшегося времени в секундах (опционально)
    pub eta_seconds: Option<u64>,
}

impl From<SourceProgress> for ProgressUpdate {
    fn from(progress: SourceProgress) -> Self {
        Self {
            percent: progress.percent,
            bytes_done: progress.downloaded_bytes,
            bytes_total: progress.total_bytes,
            speed_bytes_sec: progress.speed_bytes_sec,
            eta_seconds: progress.eta_seconds,
        }
    }
}

/// Финальный отчет по задаче.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalUpdate {
    /// Терминальное состояние задачи
    pub state: JobState,
    /// Путь к готовому артефакту (только для успешных задач)
    pub artifact_path: Option<String>,
    /// Короткая классифицированная причина отказа — никогда не сырой
    /// текст ошибки провайдера
    pub reason: Option<String>,
}

impl TerminalUpdate {
    /// Успешное завершение с путем к артефакту.
    pub fn succeeded(artifact_path: impl Into<String>) -> Self {
        Self {
            state: JobState::Succeeded,
            artifact_path: Some(artifact_path.into()),
            reason: None,
        }
    }

    /// Провал с классифицированной причиной.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            artifact_path: None,
            reason: Some(reason.into()),
        }
    }

    /// Отмена по запросу пользователя.
    pub fn cancelled() -> Self {
        Self {
            state: JobState::Cancelled,
            artifact_path: None,
            reason: None,
        }
    }
}

/// Событие прогресса, отправляемое через канальный мост.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ProgressEvent {
    /// Периодическое обновление
    Progress { job_id: Uuid, update: ProgressUpdate },
    /// Финальный отчет
    Terminal { job_id: Uuid, update: TerminalUpdate },
}

/// Приемник событий прогресса.
///
/// Ядро пушит сюда периодические и финальные события; потребляет их
/// внешний фронтенд. Репортер — это sink: его ошибки не влияют на
/// судьбу задачи.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// Периодическое обновление прогресса задачи.
    async fn report(&self, job_id: Uuid, update: ProgressUpdate);

    /// Финальный отчет по задаче.
    async fn report_terminal(&self, job_id: Uuid, update: TerminalUpdate);
}

/// Репортер, пишущий прогресс в лог.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl ProgressReporter for LogReporter {
    async fn report(&self, job_id: Uuid, update: ProgressUpdate) {
        log::info!("{}", render_progress_line(job_id, &update));
    }

    async fn report_terminal(&self, job_id: Uuid, update: TerminalUpdate) {
        let line = render_terminal_line(job_id, &update);
        match update.state {
            JobState::Failed => log::warn!("{}", line),
            _ => log::info!("{}", line),
        }
    }
}

/// Репортер-мост: пересылает события во внешний unbounded mpsc канал.
///
/// # Example
///
/// ```no_run
/// use downpour::progress::{ChannelReporter, ProgressEvent};
///
/// # async fn example() {
/// let (reporter, mut rx) = ChannelReporter::new();
/// // reporter уходит в движок, rx остается у фронтенда
/// while let Some(event) = rx.recv().await {
///     match event {
///         ProgressEvent::Progress { job_id, update } => {
///             println!("{}: {}%", job_id, update.percent);
///         }
///         ProgressEvent::Terminal { job_id, update } => {
///             println!("{}: {}", job_id, update.state);
///         }
///     }
/// }
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelReporter {
    /// Создает репортер и приемную сторону канала.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressReporter for ChannelReporter {
    async fn report(&self, job_id: Uuid, update: ProgressUpdate) {
        if self.tx.send(ProgressEvent::Progress { job_id, update }).is_err() {
            log::debug!("Progress receiver dropped, event for job {} discarded", job_id);
        }
    }

    async fn report_terminal(&self, job_id: Uuid, update: TerminalUpdate) {
        if self.tx.send(ProgressEvent::Terminal { job_id, update }).is_err() {
            log::debug!("Progress receiver dropped, terminal event for job {} discarded", job_id);
        }
    }
}

fn render_progress_line(job_id: Uuid, update: &ProgressUpdate) -> String {
    let mut line = format!(
        "📥 Job {}: {} {}%",
        job_id,
        create_progress_bar(update.percent),
        update.percent
    );

    if let Some(speed) = update.speed_bytes_sec {
        line.push_str(&format!(" | {:.1} MB/s", speed / (1024.0 * 1024.0)));
    }
    if let Some(eta) = update.eta_seconds {
        let minutes = eta / 60;
        let seconds = eta % 60;
        if minutes > 0 {
            line.push_str(&format!(" | ~{} min {} sec left", minutes, seconds));
        } else {
            line.push_str(&format!(" | ~{} sec left", seconds));
        }
    }
    if let (Some(done), Some(total)) = (update.bytes_done, update.bytes_total) {
        let done_mb = done as f64 / (1024.0 * 1024.0);
        let total_mb = total as f64 / (1024.0 * 1024.0);
        line.push_str(&format!(" | {:.1}/{:.1} MB", done_mb, total_mb));
    }

    line
}

fn render_terminal_line(job_id: Uuid, update: &TerminalUpdate) -> String {
    match update.state {
        JobState::Succeeded => format!(
            "✅ Job {} succeeded: {}",
            job_id,
            update.artifact_path.as_deref().unwrap_or("-")
        ),
        JobState::Cancelled => format!("🚫 Job {} cancelled", job_id),
        _ => format!(
            "❌ Job {} failed: {}",
            job_id,
            update.reason.as_deref().unwrap_or("unknown")
        ),
    }
}

/// Создает визуальный прогресс-бар
fn create_progress_bar(progress: u8) -> String {
    let progress = progress.min(100);
    let filled = (progress / 10) as usize;
    let empty = 10 - filled;

    let filled_blocks = "█".repeat(filled);
    let empty_blocks = "░".repeat(empty);

    format!("[{}{}]", filled_blocks, empty_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_progress_bar() {
        assert_eq!(create_progress_bar(0), "[░░░░░░░░░░]");
        assert_eq!(create_progress_bar(50), "[█████░░░░░]");
        assert_eq!(create_progress_bar(100), "[██████████]");
        // Out-of-range input clamps instead of panicking
        assert_eq!(create_progress_bar(250), "[██████████]");
    }

    #[test]
    fn test_render_progress_line() {
        let job_id = Uuid::nil();
        let bare = ProgressUpdate {
            percent: 50,
            bytes_done: None,
            bytes_total: None,
            speed_bytes_sec: None,
            eta_seconds: None,
        };
        let line = render_progress_line(job_id, &bare);
        assert!(line.contains("[█████░░░░░]"));
        assert!(line.contains("50%"));
        assert!(!line.contains("MB/s"));

        let full = ProgressUpdate {
            percent: 25,
            bytes_done: Some(1024 * 1024),
            bytes_total: Some(4 * 1024 * 1024),
            speed_bytes_sec: Some(2.0 * 1024.0 * 1024.0),
            eta_seconds: Some(95),
        };
        let line = render_progress_line(job_id, &full);
        assert!(line.contains("2.0 MB/s"));
        assert!(line.contains("~1 min 35 sec left"));
        assert!(line.contains("1.0/4.0 MB"));
    }

    #[test]
    fn test_render_terminal_line() {
        let job_id = Uuid::nil();
        let ok = render_terminal_line(job_id, &TerminalUpdate::succeeded("/tmp/track.mp3"));
        assert!(ok.starts_with('✅'));
        assert!(ok.contains("/tmp/track.mp3"));

        let failed = render_terminal_line(job_id, &TerminalUpdate::failed("rate-limited"));
        assert!(failed.starts_with('❌'));
        assert!(failed.contains("rate-limited"));

        let cancelled = render_terminal_line(job_id, &TerminalUpdate::cancelled());
        assert!(cancelled.starts_with('🚫'));
    }

    #[test]
    fn test_source_progress_mapping() {
        let source = SourceProgress {
            percent: 73,
            speed_bytes_sec: Some(512.0),
            eta_seconds: Some(12),
            downloaded_bytes: Some(100),
            total_bytes: Some(200),
        };
        let update = ProgressUpdate::from(source);
        assert_eq!(update.percent, 73);
        assert_eq!(update.bytes_done, Some(100));
        assert_eq!(update.bytes_total, Some(200));
        assert_eq!(update.eta_seconds, Some(12));
    }

    #[tokio::test]
    async fn test_channel_reporter_delivers_events() {
        let (reporter, mut rx) = ChannelReporter::new();
        let job_id = Uuid::new_v4();

        let update = ProgressUpdate {
            percent: 10,
            bytes_done: None,
            bytes_total: None,
            speed_bytes_sec: None,
            eta_seconds: None,
        };
        reporter.report(job_id, update.clone()).await;
        reporter.report_terminal(job_id, TerminalUpdate::succeeded("/tmp/a.mp3")).await;

        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Progress { job_id, update })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Terminal {
                job_id,
                update: TerminalUpdate::succeeded("/tmp/a.mp3")
            })
        );
    }

    #[tokio::test]
    async fn test_channel_reporter_survives_dropped_receiver() {
        let (reporter, rx) = ChannelReporter::new();
        drop(rx);

        // Must not panic or error out
        reporter
            .report_terminal(Uuid::new_v4(), TerminalUpdate::cancelled())
            .await;
    }
}
