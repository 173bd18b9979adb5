//! Line-oriented records menu driven from stdin.

use anyhow::Result;
use std::io::{BufRead, Write};
use tokio::sync::mpsc;

use acablock_federation::LedgerNode;
use acablock_protocol::Record;

use super::node::print_node_status;

/// Prompts for a new record, in field order
const RECORD_PROMPTS: [&str; 6] = ["Name", "Year", "University", "Course", "Teacher", "Grade"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    NewRecord,
    ListRecords,
    ListHosts,
    Status,
    Quit,
}

impl MenuChoice {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "1" => Some(Self::NewRecord),
            "2" => Some(Self::ListRecords),
            "3" => Some(Self::ListHosts),
            "4" => Some(Self::Status),
            "q" | "Q" | "quit" | "exit" => Some(Self::Quit),
            _ => None,
        }
    }
}

/// Read stdin lines on a dedicated thread.
///
/// The thread is detached so a blocked read never holds up shutdown.
pub fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Serve the menu until the operator quits or input ends
pub async fn run(node: &LedgerNode, input: &mut mpsc::Receiver<String>) -> Result<()> {
    println!("==== Welcome to Academic Block APP ====");
    loop {
        print_menu()?;
        let Some(line) = input.recv().await else {
            return Ok(());
        };

        match MenuChoice::parse(&line) {
            Some(MenuChoice::NewRecord) => {
                let Some(record) = read_record(input).await? else {
                    return Ok(());
                };
                let block = node.append_record(record).await;
                println!("You have registered successfully (block #{}).", block.index);
            }
            Some(MenuChoice::ListRecords) => {
                let records = node.list_records().await;
                println!("==== List academic records [Total: {}] ====", records.len());
                for (position, record) in records.iter().enumerate() {
                    println!("{}", format_record(position + 1, record));
                }
            }
            Some(MenuChoice::ListHosts) => {
                let hosts = format_hosts(node.local_addr(), &node.list_peers().await);
                println!("==== List hosts [Total: {}] ====", hosts.len());
                for host in hosts {
                    println!("{}", host);
                }
            }
            Some(MenuChoice::Status) => print_node_status(node).await,
            Some(MenuChoice::Quit) => return Ok(()),
            None => println!("Entered option is not valid, please try again."),
        }
    }
}

fn print_menu() -> Result<()> {
    println!("==== Menu option ====");
    println!("1. New academic record");
    println!("2. List academic records");
    println!("3. List hosts");
    println!("4. Node status");
    println!("q. Quit");
    prompt("Enter option [1|2|3|4|q]")
}

fn prompt(label: &str) -> Result<()> {
    print!("{}: ", label);
    std::io::stdout().flush()?;
    Ok(())
}

/// Prompt for every record field; `None` when input ends first
async fn read_record(input: &mut mpsc::Receiver<String>) -> Result<Option<Record>> {
    println!("==== New academic record ====");
    println!("*Please enter the next information.");
    let mut fields = Vec::with_capacity(RECORD_PROMPTS.len());
    for label in RECORD_PROMPTS {
        prompt(label)?;
        match input.recv().await {
            Some(value) => fields.push(value.trim().to_string()),
            None => return Ok(None),
        }
    }
    Ok(record_from_fields(fields))
}

fn record_from_fields(fields: Vec<String>) -> Option<Record> {
    let [name, year, university, course, teacher, grade]: [String; 6] = fields.try_into().ok()?;
    Some(Record {
        name,
        year,
        university,
        course,
        teacher,
        grade,
    })
}

fn format_record(position: usize, record: &Record) -> String {
    format!(
        "Record [#{}]\n Name: {}\n Year: {}\n University: {}\n Course: {}\n Teacher: {}\n Grade: {}",
        position,
        record.name,
        record.year,
        record.university,
        record.course,
        record.teacher,
        record.grade
    )
}

/// Own host first and marked, then the known peers
fn format_hosts(local_addr: &str, peers: &[String]) -> Vec<String> {
    std::iter::once(format!("1. {} (Your host)", local_addr))
        .chain(
            peers
                .iter()
                .enumerate()
                .map(|(i, peer)| format!("{}. {}", i + 2, peer)),
        )
        .collect()
}
