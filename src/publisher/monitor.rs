//! Logging/alerting task for publisher confirms and returns.

use tracing::{error, info, warn};

use super::{ConfirmOutcome, ConfirmSignal, PublisherSignals, ReturnSignal};

/// Signal counts seen by a monitor over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorSummary {
    pub acked: usize,
    pub nacked: usize,
    pub timed_out: usize,
    pub returned: usize,
}

/// Drains both publisher signal channels and logs each signal.
pub struct SignalMonitor {
    signals: PublisherSignals,
    summary: MonitorSummary,
}

impl SignalMonitor {
    pub fn new(signals: PublisherSignals) -> Self {
        Self {
            signals,
            summary: MonitorSummary::default(),
        }
    }

    /// Run until both channels are closed.
    pub async fn run(self) -> MonitorSummary {
        let Self {
            signals:
                PublisherSignals {
                    mut confirms,
                    mut returns,
                },
            mut summary,
        } = self;

        loop {
            tokio::select! {
                Some(signal) = confirms.recv() => on_confirm(&mut summary, signal),
                Some(signal) = returns.recv() => on_return(&mut summary, signal),
                else => break,
            }
        }
        info!(
            acked = summary.acked,
            nacked = summary.nacked,
            timed_out = summary.timed_out,
            returned = summary.returned,
            "Publisher signal monitor stopped"
        );
        summary
    }
}

fn on_confirm(summary: &mut MonitorSummary, signal: ConfirmSignal) {
    let payload = String::from_utf8_lossy(&signal.payload);
    match signal.outcome {
        ConfirmOutcome::Ack => {
            summary.acked += 1;
            info!(
                message_id = %signal.message_id,
                exchange = %signal.target.exchange,
                routing_key = %signal.target.routing_key,
                "Broker confirmed message"
            );
        }
        ConfirmOutcome::Nack { cause } => {
            summary.nacked += 1;
            error!(
                message_id = %signal.message_id,
                exchange = %signal.target.exchange,
                routing_key = %signal.target.routing_key,
                cause = cause.as_deref().unwrap_or("unspecified"),
                payload = %payload,
                "Broker rejected message (nack)"
            );
        }
        ConfirmOutcome::TimedOut => {
            summary.timed_out += 1;
            warn!(
                message_id = %signal.message_id,
                exchange = %signal.target.exchange,
                routing_key = %signal.target.routing_key,
                payload = %payload,
                "No broker confirm before timeout"
            );
        }
    }
}

fn on_return(summary: &mut MonitorSummary, signal: ReturnSignal) {
    summary.returned += 1;
    let payload = String::from_utf8_lossy(&signal.payload);
    if signal.reason.is_soft() {
        warn!(
            message_id = %signal.message_id,
            reply_code = signal.reply_code,
            reason = %signal.reason,
            reply_text = %signal.reply_text,
            exchange = %signal.exchange,
            routing_key = %signal.routing_key,
            payload = %payload,
            "Message returned by broker, not routed to any queue"
        );
    } else {
        error!(
            message_id = %signal.message_id,
            reply_code = signal.reply_code,
            reason = %signal.reason,
            reply_text = %signal.reply_text,
            exchange = %signal.exchange,
            routing_key = %signal.routing_key,
            payload = %payload,
            "Message returned by broker"
        );
    }
}
