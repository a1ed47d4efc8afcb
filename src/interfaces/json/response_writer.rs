use crate::domain::outcome::ResponseBundle;
use crate::error::Result;
use std::io::Write;

/// Writes response Bundles as pretty-printed JSON, one document per call.
pub struct ResponseWriter<W: Write> {
    writer: W,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_response(&mut self, response: &ResponseBundle) -> Result<()> {
        serde_json::to_writer_pretty(&mut self.writer, response)?;
        writeln!(self.writer)?;
        self.writer.flush()?;
        Ok(())
    }
}
