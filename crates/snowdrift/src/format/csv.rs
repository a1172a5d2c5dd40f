//! CSV load files.
//!
//! Every field is JSON text (strings are double-quoted by the JSON encoding
//! itself); nulls and empty strings are written as empty fields. The writer
//! never adds quoting of its own.

use std::fs::File;
use std::io::Write;

use csv::{QuoteStyle, WriterBuilder};
use flate2::Compression;
use flate2::write::GzEncoder;
use snafu::prelude::*;

use crate::error::{CsvSnafu, EncodeError, TempFileSnafu};
use crate::flatten::{FlatRecord, FlatSchema, FlatValue};

pub(super) fn write(file: File, rows: &[FlatRecord], schema: &FlatSchema, compress: bool) -> Result<(), EncodeError> {
    if compress {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = write_rows(encoder, rows, schema)?;
        encoder.finish().context(TempFileSnafu)?;
    } else {
        write_rows(file, rows, schema)?;
    }
    Ok(())
}

fn write_rows<W: Write>(sink: W, rows: &[FlatRecord], schema: &FlatSchema) -> Result<W, EncodeError> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .quote_style(QuoteStyle::Never)
        .from_writer(sink);

    for row in rows {
        let fields = schema
            .keys()
            .map(|column| row.get(column).and_then(FlatValue::to_json_text).unwrap_or_default());
        writer.write_record(fields).context(CsvSnafu)?;
    }

    writer
        .into_inner()
        .map_err(|err| EncodeError::TempFile { source: err.into_error() })
}
