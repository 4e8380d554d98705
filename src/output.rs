use std::io::{self, Write};

use serde::Serialize;

use crate::engine::RunSummary;
use crate::outcome::{DocumentOutcome, OutcomePage};
use crate::schedule::Trigger;
use crate::sweeper::PurgeReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_purge(result: &PurgeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_outcomes(result: &OutcomePage) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_outcome(result: &DocumentOutcome) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plan(result: &[Trigger]) -> io::Result<()> {
        Self::print_json(&result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
