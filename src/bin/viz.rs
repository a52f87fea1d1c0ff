/// ndsim live visualizer: attach to any running simulation at any time.
///
/// Run in a separate terminal:
///   cargo run --bin viz [snapshot-path]
///
/// Polls the metrics snapshot (default /tmp/ndsim_live.json) every 200ms and
/// renders a live TUI dashboard:
///
///     ┌ header: kernel / NDRange / status ─────────────────────────┐
///     │ group map (one cell per group) │ Stats: progress, counters │
///     │ q/esc: quit  …footer…                                      │
///
/// Press q or Esc to quit. The simulation keeps running unaffected.
use crossterm::{
    event::{self, Event, KeyCode},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ndsim::metrics::{LiveMetrics, METRICS_PATH, read_metrics};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
};
use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(METRICS_PATH));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run(&mut terminal, &path);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

fn run(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        let metrics = read_metrics(path);
        terminal.draw(|f| render(f, metrics.as_ref(), path))?;

        // Non-blocking: poll for 200ms, then redraw regardless
        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) {
                    break;
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level layout
// ---------------------------------------------------------------------------

fn render(f: &mut Frame, metrics: Option<&LiveMetrics>, path: &Path) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // header
            Constraint::Min(0),    // group map + stats
            Constraint::Length(1), // footer
        ])
        .split(f.area());

    render_header(f, rows[0], metrics);

    let cols = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(rows[1]);

    render_groups(f, cols[0], metrics);
    render_stats(f, cols[1], metrics);
    render_footer(f, rows[2], path);
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default()
        .title(Span::styled(
            " ⚡ ndsim live monitor ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let (name, status) = metrics
        .map(|m| (m.kernel_name.as_str(), m.status.as_str()))
        .unwrap_or(("—", "idle"));

    let status_color = match status {
        "running" => Color::Green,
        "complete" => Color::Cyan,
        _ => Color::DarkGray,
    };

    let mut spans = vec![
        Span::styled("  kernel: ", Style::default().fg(Color::DarkGray)),
        Span::styled(name, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
        Span::styled("   status: ", Style::default().fg(Color::DarkGray)),
        Span::styled(
            status.to_uppercase(),
            Style::default().fg(status_color).add_modifier(Modifier::BOLD),
        ),
    ];
    if let Some(m) = metrics {
        spans.push(Span::styled("   global: ", Style::default().fg(Color::DarkGray)));
        spans.push(Span::raw(dims(m.global_size)));
        spans.push(Span::styled("   local: ", Style::default().fg(Color::DarkGray)));
        spans.push(Span::raw(dims(m.local_size)));
    }

    f.render_widget(Paragraph::new(Line::from(spans)), inner);
}

fn dims(d: [usize; 3]) -> String {
    format!("({},{},{})", d[0], d[1], d[2])
}

// ---------------------------------------------------------------------------
// Group map
// ---------------------------------------------------------------------------

fn render_groups(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Work-groups ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let done: &[bool] = metrics.map(|m| m.group_done.as_slice()).unwrap_or(&[]);

    // Each group = 2 chars + 1 space
    let per_row = ((inner.width as usize).saturating_sub(1) / 3).max(1);
    // Leave room for the legend and the summary line
    let max_rows = (inner.height as usize).saturating_sub(4).max(1);

    let legend = Line::from(vec![
        Span::styled("██", Style::default().fg(Color::Green)),
        Span::raw(" complete   "),
        Span::styled("░░", Style::default().fg(Color::DarkGray)),
        Span::raw(" pending"),
    ]);
    let mut lines: Vec<Line> = vec![legend, Line::raw("")];

    for row in done.chunks(per_row).take(max_rows) {
        let spans: Vec<Span> = row
            .iter()
            .flat_map(|&complete| {
                let (symbol, color) =
                    if complete { ("██", Color::Green) } else { ("░░", Color::DarkGray) };
                vec![Span::styled(symbol, Style::default().fg(color)), Span::raw(" ")]
            })
            .collect();
        lines.push(Line::from(spans));
    }

    lines.push(Line::raw(""));
    let summary = match metrics {
        Some(m) if m.group_done.is_empty() && m.groups_total > 0 => {
            format!("  {} groups (too many to draw)", m.groups_total)
        }
        Some(m) => format!("  {}/{} groups complete", m.groups_completed, m.groups_total),
        None => "  no launch yet".to_string(),
    };
    lines.push(Line::from(Span::styled(summary, Style::default().fg(Color::DarkGray))));

    f.render_widget(Paragraph::new(lines), inner);
}

// ---------------------------------------------------------------------------
// Stats panel
// ---------------------------------------------------------------------------

fn render_stats(f: &mut Frame, area: Rect, metrics: Option<&LiveMetrics>) {
    let block = Block::default().title(" Stats ").borders(Borders::ALL);
    let inner = block.inner(area);
    f.render_widget(block, area);

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2), // groups gauge
            Constraint::Length(1), // spacer
            Constraint::Min(0),    // counters
        ])
        .split(inner);

    let Some(m) = metrics else {
        let msg = Paragraph::new(vec![
            Line::raw(""),
            Line::from(Span::styled(
                "  No simulation running.",
                Style::default().fg(Color::DarkGray),
            )),
            Line::from(Span::styled(
                "  Start ndsim to see live data.",
                Style::default().fg(Color::DarkGray),
            )),
        ]);
        f.render_widget(msg, inner);
        return;
    };

    let pct = if m.groups_total > 0 {
        ((m.groups_completed as f64 / m.groups_total as f64) * 100.0).min(100.0) as u16
    } else {
        0
    };
    let gauge = Gauge::default()
        .block(Block::default().title("Groups"))
        .gauge_style(Style::default().fg(Color::Blue))
        .percent(pct)
        .label(format!("{} / {}", m.groups_completed, m.groups_total));
    f.render_widget(gauge, rows[0]);

    let counter = |label: &'static str, value: u64| {
        Line::from(vec![
            Span::styled(label, Style::default().fg(Color::DarkGray)),
            Span::raw(value.to_string()),
        ])
    };
    let text = vec![
        counter("Items:        ", m.items_completed),
        counter("Instructions: ", m.instructions),
        Line::raw(""),
        counter("Loads:        ", m.loads),
        counter("Stores:       ", m.stores),
        counter("Atomics:      ", m.atomics),
        counter("Allocations:  ", m.allocations),
        Line::raw(""),
        counter("Barriers:     ", m.barriers),
    ];
    f.render_widget(Paragraph::new(text), rows[2]);
}

// ---------------------------------------------------------------------------
// Footer
// ---------------------------------------------------------------------------

fn render_footer(f: &mut Frame, area: Rect, path: &Path) {
    let text = Paragraph::new(Span::styled(
        format!(
            "  q / esc: quit    auto-refreshes every 200ms    reads {}",
            path.display()
        ),
        Style::default().fg(Color::DarkGray),
    ));
    f.render_widget(text, area);
}
