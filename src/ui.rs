//! Interface de terminal do gatework: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`SessionProgress`] acompanha visualmente uma
//! sessão; [`print_status`] e [`print_report`] formatam os resumos.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::completion::StatusSummary;
use crate::orchestrator::{BlockedItem, SessionOutcome, SessionReport};
use crate::state_machine::{ItemStatus, Step, WorkItem};

/// Indicador visual de progresso para uma sessão no terminal.
///
/// Exibe um spinner com o item e o passo atuais e mensagens coloridas para
/// commit (verde), bloqueio (vermelho) e retentativa (amarelo).
pub struct SessionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl SessionProgress {
    /// Inicia o spinner e retorna a instância de progresso.
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message("starting session");
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Atualiza a mensagem do spinner para o item e o passo atuais.
    pub fn step(&self, item_id: &str, step: Step) {
        self.pb.set_message(format!("{item_id} · {step}"));
    }

    /// Exibe uma retentativa com o número da tentativa e o motivo.
    pub fn retry(&self, step: Step, attempt: u32, max: u32, reason: &str) {
        self.pb.println(format!(
            "  {} {step} retry {attempt}/{max}: {reason}",
            self.yellow.apply_to("↻")
        ));
    }

    pub fn committed(&self, item: &WorkItem) {
        self.pb.println(format!(
            "  {} {} {}",
            self.green.apply_to("✓"),
            item.id,
            item.title
        ));
    }

    pub fn blocked(&self, blocked: &BlockedItem) {
        self.pb.println(format!(
            "  {} {} blocked at {}: {}",
            self.red.apply_to("✗"),
            blocked.item_id,
            blocked.step,
            blocked.reason
        ));
    }
}

impl Drop for SessionProgress {
    // O spinner some junto com a sessão.
    fn drop(&mut self) {
        self.pb.finish_and_clear();
    }
}

/// Imprime o resumo final de uma sessão.
pub fn print_report(report: &SessionReport) {
    let green = Style::new().green().bold();
    let yellow = Style::new().yellow();
    let status = &report.status;

    match report.outcome {
        SessionOutcome::Complete => {
            println!("{}", green.apply_to(format!("All {} items done", status.total)));
        }
        SessionOutcome::AlreadyComplete => println!("Nothing to do: backlog already complete"),
        SessionOutcome::Incomplete => println!(
            "{}/{} items done, {} committed this session, {} blocked",
            status.done,
            status.total,
            report.committed.len(),
            report.blocked.len()
        ),
    }
    for warning in &report.warnings {
        println!("  {} {warning}", yellow.apply_to("!"));
    }
    let dim = Style::new().dim();
    for m in &report.metrics {
        println!(
            "{}",
            dim.apply_to(format!(
                "  {:<10} {} calls, {} failed, avg {:.1}s",
                m.capability.as_str(),
                m.calls,
                m.failures,
                m.average_ms() as f64 / 1000.0
            ))
        );
    }
}

/// Imprime as contagens e o status de cada item do backlog.
pub fn print_status(summary: &StatusSummary) {
    let bold = Style::new().bold();
    let green = Style::new().green();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();

    println!(
        "{} {}/{} done ({} open, {} in progress)",
        bold.apply_to(&summary.project_id),
        summary.done,
        summary.total,
        summary.open,
        summary.in_progress
    );
    if let (Some(item), Some(step)) = (&summary.current_item_id, summary.current_step) {
        println!("  resuming {item} at {step}");
    }
    for item in &summary.items {
        let marker = match item.status {
            ItemStatus::Done => green.apply_to("✓"),
            ItemStatus::InProgress => yellow.apply_to("▶"),
            ItemStatus::Open => dim.apply_to("·"),
        };
        println!("  {marker} {:<10} {}", item.id, item.title);
    }
}
