use crate::analysis::RunSummary;
use comfy_table::{
    Attribute, Cell, CellAlignment, Color, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_BORDERS_ONLY,
};

fn header(labels: &[&str]) -> Vec<Cell> {
    labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let cell = Cell::new(label).add_attribute(Attribute::Bold);
            if i == 0 {
                cell
            } else {
                cell.set_alignment(CellAlignment::Right)
            }
        })
        .collect()
}

fn base_table(labels: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header(labels));
    table
}

fn count_cell(value: usize, alert: Color) -> Cell {
    let cell = Cell::new(value).set_alignment(CellAlignment::Right);
    if value > 0 {
        cell.fg(alert)
    } else {
        cell.fg(Color::DarkGrey)
    }
}

/// Per-broker task outcomes.
pub fn outcome_table(summary: &RunSummary) -> Table {
    let mut table = base_table(&["Broker", "Tasks", "Succeeded", "Failed", "Skipped", "Circuit"]);

    for (broker, stats) in &summary.brokers {
        let circuit = if stats.circuit_open {
            Cell::new("open").fg(Color::Yellow)
        } else {
            Cell::new("closed").fg(Color::DarkGrey)
        };
        table.add_row(vec![
            Cell::new(broker).fg(Color::Cyan),
            Cell::new(stats.tasks).set_alignment(CellAlignment::Right),
            count_cell(stats.succeeded, Color::Green),
            count_cell(stats.failed, Color::Red),
            count_cell(stats.skipped, Color::Yellow),
            circuit.set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

/// Representative account chosen for each broker identity.
pub fn chosen_table(summary: &RunSummary) -> Table {
    let mut table = base_table(&["Broker", "Account", "Balance", "Selected (UTC)"]);

    for marker in &summary.chosen {
        table.add_row(vec![
            Cell::new(&marker.normalized_identity).fg(Color::Cyan),
            Cell::new(&marker.display_name).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}", marker.balance))
                .fg(Color::Green)
                .set_alignment(CellAlignment::Right),
            Cell::new(marker.selected_at.format("%d-%m-%Y %H:%M:%S"))
                .set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

pub fn print_summary(summary: &RunSummary) {
    if summary.chosen.is_empty() {
        println!("\nNo broker could be reached.");
    } else {
        println!("\n(Chosen brokers)\n{}", chosen_table(summary));
    }

    if summary.brokers.is_empty() {
        println!("No tasks were scheduled.");
    } else {
        println!("\n(Task outcomes)\n{}", outcome_table(summary));
    }

    println!("{} error(s) recorded this run.", summary.errors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::BrokerSummary;
    use crate::broker_registry::ChosenBrokerMarker;
    use chrono::{TimeZone, Utc};

    fn summary() -> RunSummary {
        let mut summary = RunSummary::default();
        summary.brokers.insert(
            "deriv".to_string(),
            BrokerSummary {
                tasks: 4,
                succeeded: 1,
                failed: 3,
                skipped: 0,
                circuit_open: true,
            },
        );
        summary.chosen.push(ChosenBrokerMarker {
            chosen: true,
            display_name: "Deriv2".to_string(),
            normalized_identity: "deriv".to_string(),
            balance: 250.5,
            selected_at: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        });
        summary
    }

    #[test]
    fn outcome_rows_carry_counts_and_circuit_state() {
        let rendered = outcome_table(&summary()).to_string();
        assert!(rendered.contains("deriv"));
        assert!(rendered.contains("open"));
        assert_eq!(outcome_table(&summary()).row_count(), 1);
    }

    #[test]
    fn chosen_rows_format_balance_in_cents() {
        let rendered = chosen_table(&summary()).to_string();
        assert!(rendered.contains("Deriv2"));
        assert!(rendered.contains("250.50"));
        assert!(rendered.contains("01-06-2024 12:00:00"));
    }
}
