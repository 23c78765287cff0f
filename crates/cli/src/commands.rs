//! Command execution against a configured [`SignalBus`].

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::time::Duration;

use signalbus_infra::{Selection, SignalBus, SignalBusError, SignalRegistry};

use crate::cli::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error(transparent)]
    Bus(#[from] SignalBusError),

    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// Run `command`, writing its human-readable report to `out`.
pub fn execute(bus: &SignalBus, command: &Command, out: &mut dyn Write) -> Result<(), CommandError> {
    match command {
        Command::Flush {
            exclude,
            wait,
            signal_names,
        } => {
            let selection = select(bus.registry(), signal_names, exclude, out)?;
            let wait = wait
                .and_then(|secs| Duration::try_from_secs_f64(secs.max(0.0)).ok())
                .unwrap_or(bus.config().flush_wait);
            let count = bus.flush(&selection, wait)?;
            report_processed(out, count)?;
        }
        Command::Flushmany { signal_names } => {
            let selection = select(bus.registry(), signal_names, &[], out)?;
            let count = bus.flushmany(&selection)?;
            report_processed(out, count)?;
        }
        Command::Flushordered { signal_names } => {
            let selection = select(bus.registry(), signal_names, &[], out)?;
            let count = bus.flushordered(&selection)?;
            report_processed(out, count)?;
        }
        Command::Signals => {
            for name in bus.registry().names() {
                writeln!(out, "{name}")?;
            }
        }
        Command::Pending => report_pending(bus, out)?,
    }
    Ok(())
}

/// Registered types named in `names` (all when empty), minus `exclude`.
///
/// Unknown names are warned about and skipped.
fn select(
    registry: &SignalRegistry,
    names: &[String],
    exclude: &[String],
    out: &mut dyn Write,
) -> io::Result<Selection> {
    let names: BTreeSet<&str> = names.iter().map(String::as_str).collect();
    let exclude: BTreeSet<&str> = exclude.iter().map(String::as_str).collect();

    if !names.is_empty() && !exclude.is_empty() {
        writeln!(out, "Warning: Specified both SIGNAL_NAMES and exclude option.")?;
    }
    let checked = if names.is_empty() { &exclude } else { &names };
    for name in checked.iter().filter(|n| !registry.contains(n)) {
        writeln!(out, "Warning: A signal with name \"{name}\" does not exist.")?;
    }

    if names.is_empty() && exclude.is_empty() {
        return Ok(Selection::All);
    }
    Ok(Selection::named(registry.names().filter(|n| {
        (names.is_empty() || names.contains(n)) && !exclude.contains(n)
    })))
}

fn report_processed(out: &mut dyn Write, count: usize) -> io::Result<()> {
    match count {
        0 => Ok(()),
        1 => writeln!(out, "1 signal has been successfully processed."),
        n => writeln!(out, "{n} signals have been successfully processed."),
    }
}

fn report_pending(bus: &SignalBus, out: &mut dyn Write) -> Result<(), CommandError> {
    let counts = bus.pending()?;
    let total: u64 = counts.iter().map(|c| c.count).sum();

    let mut nonzero: Vec<(u64, String)> = counts
        .into_iter()
        .filter(|c| c.count > 0)
        .map(|c| (c.count, c.signal))
        .collect();
    nonzero.sort();

    if let Some((largest, _)) = nonzero.last() {
        let width = largest.to_string().len();
        for (count, name) in &nonzero {
            writeln!(out, "{count:>width$} of type \"{name}\"")?;
        }
    }
    writeln!(out, "{}", "-".repeat(25))?;
    writeln!(out, "Total pending: {total}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use serde_json::json;
    use signalbus_bus::InMemoryPublisher;
    use signalbus_infra::{InMemoryRowStore, RetryPolicy, SignalBusConfig};

    use crate::manifest::Manifest;

    const MANIFEST: &str = r#"
        [[signal]]
        table = "audit_signal"
        primary_key = [{ name = "id", kind = "int" }]

        [[signal]]
        table = "job_signal"
        primary_key = [{ name = "id", kind = "int" }]
        routing_key = "jobs"

        [[signal]]
        table = "mail_signal"
        primary_key = [{ name = "id", kind = "int" }]
    "#;

    struct Harness {
        store: InMemoryRowStore,
        publisher: Arc<InMemoryPublisher>,
        bus: SignalBus,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_publisher(InMemoryPublisher::new())
        }

        fn with_publisher(publisher: InMemoryPublisher) -> Self {
            let store = InMemoryRowStore::new();
            let publisher = Arc::new(publisher);
            let registry = Manifest::parse(MANIFEST).unwrap().registry().unwrap();
            let instant = RetryPolicy::new(2, Duration::ZERO, Duration::ZERO);
            let config = SignalBusConfig::default()
                .with_flush_wait(Duration::ZERO)
                .with_flush_retry(instant)
                .with_page_retry(instant);
            let bus = SignalBus::with_config(Arc::new(store.clone()), registry, publisher.clone(), config);
            Self { store, publisher, bus }
        }

        fn seed(&self, table: &str, ids: impl IntoIterator<Item = i64>) {
            let schema = self.bus.registry().get(table).unwrap().schema().clone();
            let rows = ids
                .into_iter()
                .map(|id| schema.row_from_json(json!({"id": id, "payload": "x"})).unwrap());
            self.store.insert_committed(&schema, rows).unwrap();
        }

        fn run(&self, command: Command) -> Result<String, CommandError> {
            let mut out = Vec::new();
            execute(&self.bus, &command, &mut out)?;
            Ok(String::from_utf8(out).unwrap())
        }
    }

    fn flush(exclude: &[&str], names: &[&str]) -> Command {
        Command::Flush {
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            wait: None,
            signal_names: names.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn flush_reports_processed_counts() {
        let h = Harness::new();
        h.seed("job_signal", [1, 2]);
        assert_eq!(h.run(flush(&[], &[])).unwrap(), "2 signals have been successfully processed.\n");

        h.seed("mail_signal", [1]);
        assert_eq!(h.run(flush(&[], &[])).unwrap(), "1 signal has been successfully processed.\n");

        assert_eq!(h.run(flush(&[], &[])).unwrap(), "");
    }

    #[test]
    fn flush_honours_names_and_excludes() {
        let h = Harness::new();
        h.seed("audit_signal", [1]);
        h.seed("job_signal", [1]);
        h.seed("mail_signal", [1]);

        h.run(flush(&["mail_signal"], &[])).unwrap();
        assert_eq!(h.store.row_count("mail_signal"), 1);
        assert_eq!(h.store.row_count("audit_signal"), 0);
        assert_eq!(h.store.row_count("job_signal"), 0);

        h.seed("job_signal", [2]);
        h.run(flush(&[], &["mail_signal"])).unwrap();
        assert_eq!(h.store.row_count("mail_signal"), 0);
        assert_eq!(h.store.row_count("job_signal"), 1);
    }

    #[test]
    fn flush_warns_about_unknown_names() {
        let h = Harness::new();
        h.seed("job_signal", [1]);

        let out = h.run(flush(&["audit_signal"], &["job_signal", "users"])).unwrap();

        assert_eq!(
            out,
            "Warning: Specified both SIGNAL_NAMES and exclude option.\n\
             Warning: A signal with name \"users\" does not exist.\n\
             1 signal has been successfully processed.\n"
        );
    }

    #[test]
    fn negative_wait_is_clamped() {
        let h = Harness::new();
        h.seed("job_signal", [1]);
        let command = Command::Flush {
            exclude: vec![],
            wait: Some(-5.0),
            signal_names: vec![],
        };
        assert_eq!(h.run(command).unwrap(), "1 signal has been successfully processed.\n");
    }

    #[test]
    fn flushmany_and_flushordered_report_counts() {
        let h = Harness::new();
        h.seed("job_signal", 1..=3);
        let out = h
            .run(Command::Flushmany {
                signal_names: vec![],
            })
            .unwrap();
        assert_eq!(out, "3 signals have been successfully processed.\n");

        h.seed("audit_signal", [2, 1]);
        let out = h
            .run(Command::Flushordered {
                signal_names: vec!["audit_signal".to_string()],
            })
            .unwrap();
        assert_eq!(out, "2 signals have been successfully processed.\n");

        let ids: Vec<i64> = h
            .publisher
            .delivered_bodies()
            .iter()
            .filter_map(|b| b["id"].as_i64())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 1, 2]);
    }

    #[test]
    fn signals_lists_registered_types() {
        let h = Harness::new();
        assert_eq!(h.run(Command::Signals).unwrap(), "audit_signal\njob_signal\nmail_signal\n");
    }

    #[test]
    fn pending_reports_sorted_counts() {
        let h = Harness::new();
        h.seed("job_signal", 1..=12);
        h.seed("audit_signal", 1..=3);

        let out = h.run(Command::Pending).unwrap();

        assert_eq!(
            out,
            " 3 of type \"audit_signal\"\n\
             12 of type \"job_signal\"\n\
             -------------------------\n\
             Total pending: 15\n"
        );
    }

    #[test]
    fn pending_with_nothing_pending() {
        let h = Harness::new();
        assert_eq!(h.run(Command::Pending).unwrap(), "-------------------------\nTotal pending: 0\n");
    }

    #[test]
    fn delivery_errors_propagate() {
        let h = Harness::with_publisher(InMemoryPublisher::rejecting(|m| m.routing_key() == "jobs"));
        h.seed("job_signal", [1]);

        let err = h.run(flush(&[], &[])).unwrap_err();

        assert!(matches!(err, CommandError::Bus(ref e) if e.is_delivery_error()));
        assert_eq!(h.store.row_count("job_signal"), 1);
    }
}
