use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use extsock_bridge::{HostEvent, RegionDescriptor, RegionKind};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// Kind of CPU access issued by `probe`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    MemRead,
    MemWrite,
    IoRead,
    IoWrite,
}

impl AccessKind {
    fn label(self) -> &'static str {
        match self {
            AccessKind::MemRead => "mem read",
            AccessKind::MemWrite => "mem write",
            AccessKind::IoRead => "io read",
            AccessKind::IoWrite => "io write",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct AccessRecord {
    pub kind: AccessKind,
    pub address: u32,
    pub value: u8,
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    pub socket: String,
    pub regions: Vec<RegionDescriptor>,
    pub accesses: Vec<AccessRecord>,
    pub events: Vec<HostEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
    pub timestamp: String,
}

/// What one `device` session served.
#[derive(Debug, Default, Serialize)]
pub struct SessionSummary {
    pub regions: usize,
    pub reads: u64,
    pub writes: u64,
    pub async_completed: u64,
    pub closed_by_host: bool,
}

pub fn print_probe_report(report: &ProbeReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(report)),
        OutputFormat::Table => {
            let mut regions = new_table(vec!["KIND", "BASE", "SIZE"]);
            for region in &report.regions {
                regions.add_row(vec![
                    region_kind(region.kind).to_string(),
                    format_address(region),
                    format!("{:#x}", region.size),
                ]);
            }
            println!("{regions}");

            if !report.accesses.is_empty() {
                let mut accesses = new_table(vec!["ACCESS", "ADDRESS", "VALUE"]);
                for access in &report.accesses {
                    accesses.add_row(vec![
                        access.kind.label().to_string(),
                        format!("{:#x}", access.address),
                        format!("{:#04x}", access.value),
                    ]);
                }
                println!("{accesses}");
            }

            if !report.events.is_empty() {
                let mut events = new_table(vec!["EVENT"]);
                for event in &report.events {
                    events.add_row(vec![describe_event(event)]);
                }
                println!("{events}");
            }

            if let Some(fault) = &report.fault {
                println!("fault: {fault}");
            }
        }
        OutputFormat::Pretty => {
            println!("socket={} regions={}", report.socket, report.regions.len());
            for region in &report.regions {
                println!(
                    "  region kind={} base={} size={:#x}",
                    region_kind(region.kind),
                    format_address(region),
                    region.size
                );
            }
            for access in &report.accesses {
                println!(
                    "  {} address={:#x} value={:#04x}",
                    access.kind.label(),
                    access.address,
                    access.value
                );
            }
            for event in &report.events {
                println!("  event {}", describe_event(event));
            }
            if let Some(fault) = &report.fault {
                println!("  fault={fault}");
            }
        }
    }
}

pub fn print_session_summary(summary: &SessionSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(summary)),
        OutputFormat::Table => {
            let mut table = new_table(vec!["REGIONS", "READS", "WRITES", "ASYNC", "CLOSED BY HOST"]);
            table.add_row(vec![
                summary.regions.to_string(),
                summary.reads.to_string(),
                summary.writes.to_string(),
                summary.async_completed.to_string(),
                summary.closed_by_host.to_string(),
            ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "session regions={} reads={} writes={} async={} closed_by_host={}",
                summary.regions,
                summary.reads,
                summary.writes,
                summary.async_completed,
                summary.closed_by_host
            );
        }
    }
}

pub fn describe_event(event: &HostEvent) -> String {
    match event {
        HostEvent::IrqRaised { line } => format!("irq {line} raised"),
        HostEvent::IrqLowered { line } => format!("irq {line} lowered"),
        HostEvent::DmaRead {
            channel,
            data,
            no_data: true,
        } => format!("dma channel {channel} read: no data ({data:#06x})"),
        HostEvent::DmaRead { channel, data, .. } => {
            format!("dma channel {channel} read {data:#06x}")
        }
        HostEvent::DmaWrite { channel, data } => format!("dma channel {channel} write {data:#06x}"),
    }
}

pub fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

fn to_json(value: &impl Serialize) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn region_kind(kind: RegionKind) -> &'static str {
    match kind {
        RegionKind::Memory => "memory",
        RegionKind::Io => "io",
    }
}

fn format_address(region: &RegionDescriptor) -> String {
    match region.kind {
        RegionKind::Memory => format!("{:#010x}", region.base),
        RegionKind::Io => format!("{:#06x}", region.base),
    }
}
