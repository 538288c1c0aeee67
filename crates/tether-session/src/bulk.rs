//! Bulk table exchange.
//!
//! Import writes a load step whose data lines are tab-delimited literal
//! values. Export queries the table's layout through the log, then has the
//! engine write every row to a transient TCP socket this side listens on.

use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};

use tracing::{debug, info};

use tether_types::TetherError;

use crate::attention::CancelFlag;
use crate::framing::ResultsMode;
use crate::session::{Session, SubmitOutput};
use crate::streams::EngineIo;

/// A rectangular table of optional text cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Option<String>>) -> Result<(), TetherError> {
        if row.len() != self.columns.len() {
            return Err(TetherError::Io(format!(
                "row has {} cells, table has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Parse tab-separated text: a header line, then one line per row.
    /// Empty cells are missing.
    pub fn from_tsv(text: &str) -> Result<Self, TetherError> {
        let mut lines = text.lines();
        let header = lines
            .next()
            .ok_or_else(|| TetherError::Io("empty table input".into()))?;
        let mut table = Table::new(header.split('\t').map(str::to_string).collect());
        for line in lines.filter(|l| !l.is_empty()) {
            let row = line
                .split('\t')
                .map(|cell| (!cell.is_empty()).then(|| cell.to_string()))
                .collect();
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Render as tab-separated text with a header line.
    pub fn to_tsv(&self) -> String {
        let mut out = self.columns.join("\t");
        out.push('\n');
        for row in &self.rows {
            let cells: Vec<&str> = row.iter().map(|c| c.as_deref().unwrap_or("")).collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out
    }
}

/// Storage class chosen for an imported column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text { width: usize },
    Numeric,
}

/// A column is numeric when every present cell parses as a number.
pub fn classify_columns(table: &Table) -> Vec<ColumnKind> {
    (0..table.columns.len())
        .map(|col| {
            let cells = table.rows.iter().filter_map(|row| row[col].as_deref());
            let mut numeric = true;
            let mut width = 1;
            for cell in cells {
                numeric &= cell.trim().parse::<f64>().is_ok();
                width = width.max(cell.chars().count());
            }
            if numeric {
                ColumnKind::Numeric
            } else {
                ColumnKind::Text { width }
            }
        })
        .collect()
}

/// `'name'n`, the engine's name-literal quoting.
pub fn name_literal(name: &str) -> String {
    format!("'{}'n", name.replace('\'', "''"))
}

/// The head of the load step, up to and including `datalines;`.
pub fn load_script(libref: &str, table: &str, data: &Table, kinds: &[ColumnKind]) -> String {
    let mut input = String::new();
    let mut length = String::new();
    for (name, kind) in data.columns.iter().zip(kinds) {
        input.push_str(&name_literal(name));
        input.push(' ');
        if let ColumnKind::Text { width } = kind {
            length.push_str(&format!(" {} ${width}", name_literal(name)));
        }
    }
    let mut code = format!("data {libref}.{table};\n");
    if !length.is_empty() {
        code.push_str(&format!("length{length};\n"));
    }
    code.push_str(&format!(
        "infile datalines delimiter='09'x;\n input {input};\n datalines;"
    ));
    code
}

/// One data line: every value followed by a tab.
pub fn datalines_row(row: &[Option<String>], kinds: &[ColumnKind]) -> String {
    let mut line = String::new();
    for (cell, kind) in row.iter().zip(kinds) {
        match (cell, kind) {
            (Some(value), _) => line.push_str(&value.replace(['\t', '\n', '\r'], " ")),
            (None, ColumnKind::Numeric) => line.push('.'),
            (None, ColumnKind::Text { .. }) => line.push(' '),
        }
        line.push('\t');
    }
    line
}

/// Step that prints the table's record length, variable names and
/// storage classes to the log.
pub fn metadata_query(libref: &str, table: &str) -> String {
    format!(
        "data _null_; file STDERR;d = open('{libref}.{table}');\n\
         lrecl = attrn(d, 'LRECL'); nvars = attrn(d, 'NVARS');\n\
         lr='LRECL='; vn='VARNUMS='; vl='VARLIST='; vt='VARTYPE=';\n\
         put lr lrecl; put vn nvars; put vl;\n\
         do i = 1 to nvars; var = varname(d, i); put var; end;\n\
         put vt;\n\
         do i = 1 to nvars; var = vartype(d, i); put var; end;\n\
         run;"
    )
}

/// One column as reported by the metadata query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub numeric: bool,
    /// Display format category, once the format query has run.
    pub format: Option<String>,
}

impl ColumnMeta {
    /// Numeric columns without a date/time format travel as `best32.`.
    pub fn wants_numeric_literal(&self) -> bool {
        self.numeric && !self.format.as_deref().is_some_and(is_datetime_format)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub lrecl: usize,
    pub columns: Vec<ColumnMeta>,
}

fn malformed(what: &str) -> TetherError {
    TetherError::MalformedMetadata(what.to_string())
}

/// Parse the metadata query's log output.
///
/// The labelled lines are read positionally from the last `LRECL= ` on.
pub fn parse_metadata(log: &str) -> Result<TableMetadata, TetherError> {
    let start = log
        .rfind("LRECL= ")
        .ok_or_else(|| malformed("no LRECL= line in query output"))?;
    let mut lines = log[start..].lines().map(str::trim);

    let lrecl = labelled_number(lines.next(), "LRECL=")?;
    let nvars = labelled_number(lines.next(), "VARNUMS=")?;
    if lines.next() != Some("VARLIST=") {
        return Err(malformed("expected VARLIST= after VARNUMS="));
    }
    let names: Vec<String> = lines.by_ref().take(nvars).map(str::to_string).collect();
    if names.len() != nvars || names.iter().any(String::is_empty) {
        return Err(malformed("variable list shorter than VARNUMS="));
    }
    if lines.next() != Some("VARTYPE=") {
        return Err(malformed("expected VARTYPE= after the variable list"));
    }
    let types: Vec<&str> = lines.take(nvars).collect();
    if types.len() != nvars {
        return Err(malformed("type list shorter than VARNUMS="));
    }

    let columns = names
        .into_iter()
        .zip(types)
        .map(|(name, ty)| match ty {
            "N" => Ok(ColumnMeta { name, numeric: true, format: None }),
            "C" => Ok(ColumnMeta { name, numeric: false, format: None }),
            other => Err(malformed(&format!("unknown variable type {other:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(TableMetadata { lrecl, columns })
}

fn labelled_number(line: Option<&str>, label: &str) -> Result<usize, TetherError> {
    line.and_then(|l| l.strip_prefix(label))
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| malformed(&format!("expected `{label} <number>`")))
}

/// Step that prints each variable's format name after `FMT_CATS=`.
pub fn format_query(libref: &str, table: &str, columns: &[ColumnMeta]) -> String {
    let mut code = format!("data _null_; set {libref}.{table}(obs=1);put 'FMT_CATS=';\n");
    for col in columns {
        code.push_str(&format!("_fmt = vformatn({});put _fmt;\n", name_literal(&col.name)));
    }
    code.push_str("run;\n");
    code
}

/// Parse the format query's log output into one format name per column.
pub fn parse_format_categories(log: &str, nvars: usize) -> Result<Vec<String>, TetherError> {
    let start = log
        .rfind("FMT_CATS=")
        .ok_or_else(|| malformed("no FMT_CATS= line in query output"))?;
    let cats: Vec<String> = log[start..]
        .lines()
        .skip(1)
        .take(nvars)
        .map(|l| l.trim().to_string())
        .collect();
    if cats.len() != nvars {
        return Err(malformed("format list shorter than the variable list"));
    }
    Ok(cats)
}

/// Whether `format` renders a number as a date, time or datetime.
pub fn is_datetime_format(format: &str) -> bool {
    DATETIME_FORMATS
        .binary_search(&format.trim().to_ascii_uppercase().as_str())
        .is_ok()
}

/// Step that writes every row of the table, tab-delimited, to `host:port`.
pub fn unload_script(
    libref: &str,
    table: &str,
    host: &str,
    port: u16,
    columns: &[ColumnMeta],
) -> String {
    let mut code = format!(
        "filename sock socket '{host}:{port}' lrecl=32767 recfm=v termstr=LF;\n \
         data _null_; set {libref}.{table};\n file sock; put "
    );
    for (i, col) in columns.iter().enumerate() {
        code.push_str(&name_literal(&col.name));
        code.push(' ');
        if col.wants_numeric_literal() {
            code.push_str("best32. ");
        }
        if i + 1 < columns.len() {
            code.push_str("'09'x ");
        }
    }
    code.push_str("; run;\n");
    code
}

/// Rebuild rows from what the engine wrote to the socket.
pub fn parse_rows(text: &str, columns: &[ColumnMeta]) -> Vec<Vec<Option<String>>> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut fields = line.split('\t');
            columns
                .iter()
                .map(|col| {
                    let raw = fields.next().unwrap_or("");
                    let value = if col.numeric { raw.trim() } else { raw.trim_end() };
                    match value {
                        "" => None,
                        "." if col.numeric => None,
                        v => Some(v.to_string()),
                    }
                })
                .collect()
        })
        .collect()
}

/// Listening end of an export transfer.
///
/// Pumped once per poll cycle while the unload step runs, so the engine
/// never blocks on a full socket buffer.
struct SocketSink {
    listener: TcpListener,
    stream: Option<TcpStream>,
    data: Vec<u8>,
    eof: bool,
}

impl SocketSink {
    fn bind() -> Result<Self, TetherError> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .map_err(|e| TetherError::SocketTransfer(format!("bind: {e}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| TetherError::SocketTransfer(format!("listener: {e}")))?;
        Ok(Self {
            listener,
            stream: None,
            data: Vec::new(),
            eof: false,
        })
    }

    fn port(&self) -> Result<u16, TetherError> {
        self.listener
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| TetherError::SocketTransfer(format!("local address: {e}")))
    }

    /// Accept the connection if it is waiting, then read what is available.
    fn pump(&mut self) -> Result<(), TetherError> {
        if self.stream.is_none() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "export connection accepted");
                    stream
                        .set_nonblocking(true)
                        .map_err(|e| TetherError::SocketTransfer(format!("stream: {e}")))?;
                    self.stream = Some(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(TetherError::SocketTransfer(format!("accept: {e}"))),
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        let mut buf = [0u8; 4096];
        while !self.eof {
            match stream.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => self.data.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(TetherError::SocketTransfer(format!("read: {e}"))),
            }
        }
        Ok(())
    }

    /// Collect the rest once the unload step has finished.
    fn finish(mut self) -> Result<Vec<u8>, TetherError> {
        self.pump()?;
        let Some(mut stream) = self.stream.take() else {
            return Err(TetherError::SocketTransfer(
                "the engine finished the unload step without connecting".into(),
            ));
        };
        if !self.eof {
            stream
                .set_nonblocking(false)
                .map_err(|e| TetherError::SocketTransfer(format!("stream: {e}")))?;
            stream
                .read_to_end(&mut self.data)
                .map_err(|e| TetherError::SocketTransfer(format!("read: {e}")))?;
        }
        Ok(self.data)
    }
}

impl<I: EngineIo> Session<I> {
    /// Create `libref.table` from `data` and return the load step's log.
    pub fn import_table(
        &mut self,
        libref: &str,
        table: &str,
        data: &Table,
    ) -> Result<SubmitOutput, TetherError> {
        let kinds = classify_columns(data);
        self.asubmit(&load_script(libref, table, data, &kinds), ResultsMode::Text)?;
        for row in &data.rows {
            self.asubmit(&datalines_row(row, &kinds), ResultsMode::Text)?;
            // the engine echoes each data line to its log; keep that pipe empty
            self.absorb_pending()?;
        }
        self.asubmit(";run;", ResultsMode::Text)?;
        info!(libref, table, rows = data.len(), columns = data.columns.len(), "table imported");
        self.submit("", ResultsMode::Text)
    }

    /// Read `libref.table` back over a transient socket.
    pub fn export_table(&mut self, libref: &str, table: &str) -> Result<Table, TetherError> {
        let query = self.submit(&metadata_query(libref, table), ResultsMode::Text)?;
        let mut meta = parse_metadata(&query.log)?;

        let query = self.submit(
            &format_query(libref, table, &meta.columns),
            ResultsMode::Text,
        )?;
        let formats = parse_format_categories(&query.log, meta.columns.len())?;
        for (col, format) in meta.columns.iter_mut().zip(formats) {
            col.format = Some(format);
        }

        let mut sink = SocketSink::bind()?;
        let port = sink.port()?;
        let host = if self.engine().is_remote() {
            nix::unistd::gethostname()
                .map_err(|e| TetherError::SocketTransfer(format!("gethostname: {e}")))?
                .to_string_lossy()
                .into_owned()
        } else {
            String::new()
        };
        debug!(%host, port, lrecl = meta.lrecl, "starting export transfer");

        let script = unload_script(libref, table, &host, port, &meta.columns);
        self.run_submission(&script, ResultsMode::Text, &CancelFlag::new(), || sink.pump())?;
        let data = sink.finish()?;

        let names = meta.columns.iter().map(|c| c.name.clone()).collect();
        let mut out = Table::new(names);
        out.rows = parse_rows(&String::from_utf8_lossy(&data), &meta.columns);
        info!(libref, table, rows = out.len(), port, "table exported");
        Ok(out)
    }
}

/// Format names whose values are dates, times or datetimes. Sorted.
const DATETIME_FORMATS: &[&str] = &[
    "AFRDFDD", "AFRDFDE", "AFRDFDN", "AFRDFDT", "AFRDFDWN", "AFRDFMN", "AFRDFMY", "AFRDFWDX",
    "AFRDFWKX", "ANYDTDTE", "ANYDTDTM", "ANYDTTME", "B8601DA", "B8601DJ", "B8601DN", "B8601DT",
    "B8601DZ", "B8601LZ", "B8601TM", "B8601TZ", "CATDFDD", "CATDFDE", "CATDFDN", "CATDFDT",
    "CATDFDWN", "CATDFMN", "CATDFMY", "CATDFWDX", "CATDFWKX", "CRODFDD", "CRODFDE", "CRODFDN",
    "CRODFDT", "CRODFDWN", "CRODFMN", "CRODFMY", "CRODFWDX", "CRODFWKX", "CSYDFDD", "CSYDFDE",
    "CSYDFDN", "CSYDFDT", "CSYDFDWN", "CSYDFMN", "CSYDFMY", "CSYDFWDX", "CSYDFWKX", "DANDFDD",
    "DANDFDE", "DANDFDN", "DANDFDT", "DANDFDWN", "DANDFMN", "DANDFMY", "DANDFWDX", "DANDFWKX",
    "DATE", "DATEAMPM", "DATETIME", "DAY", "DDMMYY", "DDMMYYB", "DDMMYYC", "DDMMYYD", "DDMMYYN",
    "DDMMYYP", "DDMMYYS", "DESDFDD", "DESDFDE", "DESDFDN", "DESDFDT", "DESDFDWN", "DESDFMN",
    "DESDFMY", "DESDFWDX", "DESDFWKX", "DEUDFDD", "DEUDFDE", "DEUDFDN", "DEUDFDT", "DEUDFDWN",
    "DEUDFMN", "DEUDFMY", "DEUDFWDX", "DEUDFWKX", "DOWNAME", "DTDATE", "DTMONYY", "DTWKDATX",
    "DTYEAR", "DTYYQC", "E8601DA", "E8601DN", "E8601DT", "E8601DZ", "E8601LZ", "E8601TM",
    "E8601TZ", "ENGDFDD", "ENGDFDE", "ENGDFDN", "ENGDFDT", "ENGDFDWN", "ENGDFMN", "ENGDFMY",
    "ENGDFWDX", "ENGDFWKX", "ESPDFDD", "ESPDFDE", "ESPDFDN", "ESPDFDT", "ESPDFDWN", "ESPDFMN",
    "ESPDFMY", "ESPDFWDX", "ESPDFWKX", "EURDFDD", "EURDFDE", "EURDFDN", "EURDFDT", "EURDFDWN",
    "EURDFMN", "EURDFMY", "EURDFWDX", "EURDFWKX", "FINDFDD", "FINDFDE", "FINDFDN", "FINDFDT",
    "FINDFDWN", "FINDFMN", "FINDFMY", "FINDFWDX", "FINDFWKX", "FRADFDD", "FRADFDE", "FRADFDN",
    "FRADFDT", "FRADFDWN", "FRADFMN", "FRADFMY", "FRADFWDX", "FRADFWKX", "FRSDFDD", "FRSDFDE",
    "FRSDFDN", "FRSDFDT", "FRSDFDWN", "FRSDFMN", "FRSDFMY", "FRSDFWDX", "FRSDFWKX", "HHMM",
    "HOUR", "HUNDFDD", "HUNDFDE", "HUNDFDN", "HUNDFDT", "HUNDFDWN", "HUNDFMN", "HUNDFMY",
    "HUNDFWDX", "HUNDFWKX", "IS8601DA", "IS8601DN", "IS8601DT", "IS8601DZ", "IS8601LZ",
    "IS8601TM", "IS8601TZ", "ITADFDD", "ITADFDE", "ITADFDN", "ITADFDT", "ITADFDWN", "ITADFMN",
    "ITADFMY", "ITADFWDX", "ITADFWKX", "JDATEMD", "JDATEMDW", "JDATEMNW", "JDATEMON",
    "JDATEQRW", "JDATEQTR", "JDATESEM", "JDATESMW", "JDATEWK", "JDATEYDW", "JDATEYM",
    "JDATEYMD", "JDATEYMW", "JDATEYT", "JDATEYTW", "JNENGO", "JNENGOT", "JNENGOTW", "JNENGOW",
    "JTIMEH", "JTIMEHM", "JTIMEHMS", "JTIMEHW", "JTIMEMW", "JTIMESW", "JULDATE", "JULDAY",
    "JULIAN", "MACDFDD", "MACDFDE", "MACDFDN", "MACDFDT", "MACDFDWN", "MACDFMN", "MACDFMY",
    "MACDFWDX", "MACDFWKX", "MDYAMPM", "MINGUO", "MMDDYY", "MMDDYYB", "MMDDYYC", "MMDDYYD",
    "MMDDYYN", "MMDDYYP", "MMDDYYS", "MMSS", "MMYY", "MMYYC", "MMYYD", "MMYYN", "MMYYP",
    "MMYYS", "MONNAME", "MONTH", "MONYY", "ND8601DA", "ND8601DN", "ND8601DT", "ND8601DZ",
    "ND8601TM", "ND8601TZ", "NENGO", "NLDATE", "NLDATEL", "NLDATEM", "NLDATEMD", "NLDATEMDL",
    "NLDATEMDM", "NLDATEMDS", "NLDATEMN", "NLDATES", "NLDATEW", "NLDATEWN", "NLDATEYM",
    "NLDATEYML", "NLDATEYMM", "NLDATEYMS", "NLDATEYQ", "NLDATEYQL", "NLDATEYQM", "NLDATEYQS",
    "NLDATEYR", "NLDATEYW", "NLDATM", "NLDATMAP", "NLDATMDT", "NLDATML", "NLDATMM", "NLDATMMD",
    "NLDATMMDL", "NLDATMMDM", "NLDATMMDS", "NLDATMMN", "NLDATMS", "NLDATMTM", "NLDATMTZ",
    "NLDATMW", "NLDATMWN", "NLDATMWZ", "NLDATMYM", "NLDATMYML", "NLDATMYMM", "NLDATMYMS",
    "NLDATMYQ", "NLDATMYQL", "NLDATMYQM", "NLDATMYQS", "NLDATMYR", "NLDATMYW", "NLDATMZ",
    "NLDDFDD", "NLDDFDE", "NLDDFDN", "NLDDFDT", "NLDDFDWN", "NLDDFMN", "NLDDFMY", "NLDDFWDX",
    "NLDDFWKX", "NLTIMAP", "NLTIME", "NORDFDD", "NORDFDE", "NORDFDN", "NORDFDT", "NORDFDWN",
    "NORDFMN", "NORDFMY", "NORDFWDX", "NORDFWKX", "POLDFDD", "POLDFDE", "POLDFDN", "POLDFDT",
    "POLDFDWN", "POLDFMN", "POLDFMY", "POLDFWDX", "POLDFWKX", "PTGDFDD", "PTGDFDE", "PTGDFDN",
    "PTGDFDT", "PTGDFDWN", "PTGDFMN", "PTGDFMY", "PTGDFWDX", "PTGDFWKX", "QTR", "QTRR",
    "RUSDFDD", "RUSDFDE", "RUSDFDN", "RUSDFDT", "RUSDFDWN", "RUSDFMN", "RUSDFMY", "RUSDFWDX",
    "RUSDFWKX", "SLODFDD", "SLODFDE", "SLODFDN", "SLODFDT", "SLODFDWN", "SLODFMN", "SLODFMY",
    "SLODFWDX", "SLODFWKX", "STIMER", "SVEDFDD", "SVEDFDE", "SVEDFDN", "SVEDFDT", "SVEDFDWN",
    "SVEDFMN", "SVEDFMY", "SVEDFWDX", "SVEDFWKX", "TIME", "TIMEAMPM", "TOD", "TWMDY",
    "WEEKDATE", "WEEKDATX", "WEEKDAY", "WEEKU", "WEEKV", "WEEKW", "WORDDATE", "WORDDATX",
    "XYYMMDD", "YEAR", "YMDDTTM", "YYMM", "YYMMC", "YYMMD", "YYMMDD", "YYMMDDB", "YYMMDDC",
    "YYMMDDD", "YYMMDDN", "YYMMDDP", "YYMMDDS", "YYMMN", "YYMMP", "YYMMS", "YYMON", "YYQ",
    "YYQC", "YYQD", "YYQN", "YYQP", "YYQR", "YYQRC", "YYQRD", "YYQRN", "YYQRP", "YYQRS", "YYQS",
    "YYQZ", "YYWEEKU", "YYWEEKV", "YYWEEKW",
];
