use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::{Stream, stream};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use mailverify_lib::pipeline::BoxError;
use mailverify_lib::{AddressSink, EmailRecord, VerifyStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Human,
    #[cfg(feature = "with-csv")]
    Csv,
    #[cfg(feature = "with-serde")]
    Ndjson,
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "human" => Ok(Self::Human),
            #[cfg(feature = "with-csv")]
            "csv" => Ok(Self::Csv),
            #[cfg(not(feature = "with-csv"))]
            "csv" => bail!("format=csv nécessite la feature 'with-csv'"),
            #[cfg(feature = "with-serde")]
            "ndjson" => Ok(Self::Ndjson),
            #[cfg(not(feature = "with-serde"))]
            "ndjson" => bail!("format=ndjson nécessite la feature 'with-serde'"),
            other => bail!("unknown --format '{other}', use: human|csv|ndjson"),
        }
    }
}

pub type Input = Box<dyn AsyncRead + Unpin + Send>;
pub type Output = Box<dyn AsyncWrite + Unpin + Send>;

/// ouvre `path`, ou stdin si absent ou `-`
pub async fn open_input(path: Option<&Path>) -> Result<Input> {
    match path {
        Some(path) if path != Path::new("-") => {
            let file = File::open(path)
                .await
                .with_context(|| format!("open {}", path.display()))?;
            Ok(Box::new(file))
        }
        _ => Ok(Box::new(tokio::io::stdin())),
    }
}

/// un enregistrement par ligne non vide, espaces de bord retirés
pub fn read_records<Rd>(reader: Rd) -> impl Stream<Item = io::Result<EmailRecord>> + Send
where
    Rd: AsyncRead + Unpin + Send + 'static,
{
    let lines = BufReader::new(reader).lines();
    stream::unfold(lines, |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let address = line.trim();
                    if address.is_empty() {
                        continue;
                    }
                    let record = EmailRecord::new(address);
                    return Some((Ok(record), lines));
                }
                Ok(None) => return None,
                Err(err) => return Some((Err(err), lines)),
            }
        }
    })
}

/// écrit les paires `adresse,statut` au fil des résultats
///
/// avec `--out`, les lignes vont dans `<path>.tmp`, renommé en `<path>` à la fermeture
pub struct ReportSink<W> {
    format: Format,
    out: BufWriter<W>,
    commit: Option<(PathBuf, PathBuf)>,
}

impl ReportSink<Output> {
    pub async fn create(format: Format, path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return ReportSink::new(format, Box::new(tokio::io::stdout()) as Output).await;
        };
        let tmp = PathBuf::from(format!("{}.tmp", path.display()));
        let file = File::create(&tmp)
            .await
            .with_context(|| format!("create {}", tmp.display()))?;
        let mut sink = ReportSink::new(format, Box::new(file) as Output).await?;
        sink.commit = Some((tmp, path.to_path_buf()));
        Ok(sink)
    }
}

impl<W: AsyncWrite + Unpin + Send> ReportSink<W> {
    pub async fn new(format: Format, writer: W) -> Result<Self> {
        #[cfg_attr(not(feature = "with-csv"), allow(unused_mut))]
        let mut sink = Self {
            format,
            out: BufWriter::new(writer),
            commit: None,
        };
        #[cfg(feature = "with-csv")]
        if format == Format::Csv {
            let header = csv_line(["address", "status"]).context("csv header")?;
            sink.out.write_all(&header).await?;
        }
        Ok(sink)
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

fn render(format: Format, record: &EmailRecord, status: VerifyStatus) -> Result<Vec<u8>, BoxError> {
    match format {
        Format::Human => {
            Ok(format!("[{}] {}\n", status.code(), record.address).into_bytes())
        }
        #[cfg(feature = "with-csv")]
        Format::Csv => Ok(csv_line([record.address.as_str(), status.code()])?),
        #[cfg(feature = "with-serde")]
        Format::Ndjson => {
            let mut line = serde_json::to_vec(&serde_json::json!({
                "address": record.address,
                "status": status,
            }))?;
            line.push(b'\n');
            Ok(line)
        }
    }
}

#[cfg(feature = "with-csv")]
fn csv_line<const N: usize>(fields: [&str; N]) -> io::Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(fields)?;
    wtr.into_inner().map_err(|err| err.into_error())
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> AddressSink<EmailRecord> for ReportSink<W> {
    async fn write(&mut self, record: EmailRecord, status: VerifyStatus) -> Result<(), BoxError> {
        let line = render(self.format, &record, status)?;
        self.out.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), BoxError> {
        self.out.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.out.flush().await?;
        if let Some((tmp, path)) = self.commit.take() {
            tokio::fs::rename(&tmp, &path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn skips_blank_lines() {
        let input: &[u8] = b"alice@example.com\n\n  bob@example.com \r\n   \n";
        let records: Vec<_> = read_records(input)
            .map(|record| record.unwrap().address)
            .collect()
            .await;
        assert_eq!(records, vec!["alice@example.com", "bob@example.com"]);
    }

    #[test]
    fn parses_formats() {
        assert_eq!("human".parse::<Format>().unwrap(), Format::Human);
        assert!("xml".parse::<Format>().is_err());
    }

    #[tokio::test]
    async fn human_lines_pair_address_and_status() {
        let mut sink = ReportSink::new(Format::Human, Vec::new()).await.unwrap();
        sink.write(
            EmailRecord::new("alice@example.com"),
            VerifyStatus::SmtpVerified,
        )
        .await
        .unwrap();
        sink.write(EmailRecord::new("nope"), VerifyStatus::Invalid)
            .await
            .unwrap();
        sink.close().await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "[smtp_user_exists] alice@example.com\n[invalid] nope\n");
    }

    #[cfg(feature = "with-csv")]
    #[tokio::test]
    async fn csv_has_a_header() {
        let mut sink = ReportSink::new(Format::Csv, Vec::new()).await.unwrap();
        sink.write(
            EmailRecord::new("bob@example.com"),
            VerifyStatus::SmtpUserNotFound,
        )
        .await
        .unwrap();
        sink.close().await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "address,status\nbob@example.com,smtp_user_not_found\n");
    }

    #[cfg(feature = "with-serde")]
    #[tokio::test]
    async fn ndjson_uses_status_codes() {
        let mut sink = ReportSink::new(Format::Ndjson, Vec::new()).await.unwrap();
        sink.write(
            EmailRecord::new("carol@example.com"),
            VerifyStatus::NoMxRecords,
        )
        .await
        .unwrap();
        sink.close().await.unwrap();

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(out.trim_end()).unwrap();
        assert_eq!(value["address"], "carol@example.com");
        assert_eq!(value["status"], "no_mx_records");
    }
}
