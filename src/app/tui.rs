use std::io::{self, Stdout};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Wrap};
use tokio::sync::mpsc::UnboundedReceiver;

use super::data_io::ManifestSink;
use super::runtime::handle_harvest_event;
use super::types::{HarvestEvent, HarvestPlan, ProgressState};
use super::ui_utils::{format_bytes, status_style, truncate_middle};

const TICK_RATE: Duration = Duration::from_millis(120);
const LOG_LINES: usize = 6;

pub fn draw_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    plan: &HarvestPlan,
    state: &mut ProgressState,
    mut sink: Option<&mut ManifestSink>,
    stop: &AtomicBool,
    auto_close: bool,
    rx: &mut UnboundedReceiver<HarvestEvent>,
) -> io::Result<()> {
    let mut last_tick = Instant::now();
    let entry_url = plan.entry_url();

    loop {
        while let Ok(event) = rx.try_recv() {
            handle_harvest_event(state, sink.as_deref_mut(), event)?;
        }

        terminal.draw(|f| {
            let chunks = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(4),
                    Constraint::Length(3),
                    Constraint::Min(8),
                    Constraint::Length(LOG_LINES as u16 + 2),
                ])
                .split(f.area());

            let title = if state.done {
                if auto_close {
                    "reaper - Finished (auto-closing)"
                } else {
                    "reaper - Finished (press q to quit)"
                }
            } else if stop.load(Ordering::Relaxed) {
                "reaper - Stopping"
            } else {
                "reaper - Running (press q to stop)"
            };

            let label = Style::default().fg(Color::Gray);
            let sep = Style::default().fg(Color::DarkGray);
            let value = Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD);
            let current_page = state
                .current_page
                .map(|page| page.to_string())
                .unwrap_or_else(|| "-".to_string());
            let header_lines = vec![
                Line::from(vec![
                    Span::styled("Site ", label),
                    Span::styled(
                        format!("{} ({})", plan.site_label(), plan.run_name()),
                        value,
                    ),
                    Span::styled("  |  ", sep),
                    Span::styled("Page ", label),
                    Span::styled(current_page, value),
                    Span::styled("  |  ", sep),
                    Span::styled("Items ", label),
                    Span::styled(state.items.to_string(), value),
                    Span::styled("  |  ", sep),
                    Span::styled("Saved ", label),
                    Span::styled(
                        state.saved.to_string(),
                        Style::default()
                            .fg(Color::Green)
                            .add_modifier(Modifier::BOLD),
                    ),
                    Span::styled("  |  ", sep),
                    Span::styled("Failed ", label),
                    Span::styled(
                        state.failed.to_string(),
                        Style::default().fg(if state.failed > 0 {
                            Color::Red
                        } else {
                            Color::Gray
                        }),
                    ),
                    Span::styled("  |  ", sep),
                    Span::styled("Bytes ", label),
                    Span::styled(format_bytes(state.bytes), value),
                ]),
                Line::from(Span::styled(
                    truncate_middle(&entry_url, chunks[0].width.saturating_sub(4) as usize),
                    sep,
                )),
            ];
            f.render_widget(
                Paragraph::new(header_lines)
                    .block(Block::default().title(title).borders(Borders::ALL)),
                chunks[0],
            );

            let gauge = Gauge::default()
                .block(Block::default().title("Pages").borders(Borders::ALL))
                .gauge_style(
                    Style::default()
                        .fg(if state.done {
                            Color::Green
                        } else {
                            Color::Cyan
                        })
                        .bg(Color::Black)
                        .add_modifier(Modifier::BOLD),
                )
                .ratio(state.page_ratio())
                .label(format!("{}/{}", state.pages_started, state.pages_total));
            f.render_widget(gauge, chunks[1]);

            let path_width = chunks[2].width.saturating_sub(40) as usize;
            let rows = state.records.iter().map(|record| {
                let detail = if record.error.is_empty() {
                    record.path.display().to_string()
                } else {
                    record.error.clone()
                };
                Row::new(vec![
                    Cell::from(record.page.to_string()),
                    Cell::from(format!("{}/{}", record.item, record.image)),
                    Cell::from(record.status.label()).style(status_style(record.status)),
                    Cell::from(format_bytes(record.bytes)),
                    Cell::from(truncate_middle(&detail, path_width)),
                ])
            });
            let table = Table::new(
                rows,
                [
                    Constraint::Length(6),
                    Constraint::Length(8),
                    Constraint::Length(8),
                    Constraint::Length(10),
                    Constraint::Min(10),
                ],
            )
            .header(
                Row::new(vec!["Page", "Item", "Status", "Size", "File"])
                    .style(Style::default().add_modifier(Modifier::BOLD)),
            )
            .block(Block::default().title("Images").borders(Borders::ALL));
            f.render_widget(table, chunks[2]);

            let log_chunks = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
                .split(chunks[3]);
            let status_lines: Vec<Line> = state
                .status_messages
                .iter()
                .take(LOG_LINES)
                .map(|message| Line::from(message.as_str()))
                .collect();
            f.render_widget(
                Paragraph::new(status_lines)
                    .block(Block::default().title("Status").borders(Borders::ALL))
                    .wrap(Wrap { trim: true }),
                log_chunks[0],
            );
            let error_lines: Vec<Line> = state
                .errors
                .iter()
                .take(LOG_LINES)
                .map(|message| {
                    Line::from(Span::styled(
                        message.as_str(),
                        Style::default().fg(Color::Red),
                    ))
                })
                .collect();
            f.render_widget(
                Paragraph::new(error_lines)
                    .block(Block::default().title("Errors").borders(Borders::ALL))
                    .wrap(Wrap { trim: true }),
                log_chunks[1],
            );
        })?;

        if let Some(sink) = sink.as_deref_mut() {
            sink.flush()?;
        }

        let timeout = TICK_RATE.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            let ctrl_c = key.code == KeyCode::Char('c')
                && key.modifiers.contains(KeyModifiers::CONTROL);
            if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) || ctrl_c {
                stop.store(true, Ordering::Relaxed);
                break;
            }
        }

        if last_tick.elapsed() >= TICK_RATE {
            last_tick = Instant::now();
        }

        if state.done && auto_close {
            break;
        }
    }

    Ok(())
}
