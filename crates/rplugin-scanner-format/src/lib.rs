//! Binary shape of the plugin scanner's cache file.
//!
//! This crate only implements the cache file's byte layout (read and
//! write); the actual directory walk that discovers installed plugins and
//! decides what to put in a cache entry is a separate, out-of-scope
//! collaborator. Fixed-width string fields mirror the original cache
//! format: dll path, name and maker are truncated or zero-padded to 64
//! bytes rather than length-prefixed, so the leading fields of an entry are
//! fixed-size; the trailing parameter and program name arrays are
//! length-prefixed since their count varies per plugin.

use std::io::{Read, Write};

use rplugin_core::{Error, Result};

const DLL_FIELD_LEN: usize = 64;
const NAME_FIELD_LEN: usize = 64;
const MAKER_FIELD_LEN: usize = 64;
const CACHE_VERSION: i32 = 2;

/// One automatable parameter's cache record: its display name and default
/// value, the two fields the original scanner persists per parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterCacheEntry {
    pub name: String,
    pub default_value: f32,
}

/// One plugin's entry in the scanner cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub unique_id: i32,
    pub dll: String,
    pub name: String,
    pub maker: String,
    pub input_count: i32,
    pub output_count: i32,
    pub is_synth: bool,
    pub has_gui: bool,
    pub parameters: Vec<ParameterCacheEntry>,
    pub programs: Vec<String>,
}

fn write_fixed_string(out: &mut impl Write, value: &str, field_len: usize) -> Result<()> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.truncate(field_len);
    bytes.resize(field_len, 0);
    out.write_all(&bytes)?;
    Ok(())
}

fn read_fixed_string(input: &mut impl Read, field_len: usize) -> Result<String> {
    let mut buf = vec![0u8; field_len];
    input.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(field_len);
    String::from_utf8(buf[..end].to_vec())
        .map_err(|e| Error::ProtocolViolation(format!("non-utf8 cache string: {e}")))
}

fn write_i32(out: &mut impl Write, value: i32) -> Result<()> {
    out.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_i32(input: &mut impl Read) -> Result<i32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_non_negative_count(input: &mut impl Read, what: &str) -> Result<usize> {
    let count = read_i32(input)?;
    if count < 0 {
        return Err(Error::ProtocolViolation(format!("negative {what} count {count}")));
    }
    Ok(count as usize)
}

impl CacheEntry {
    fn write_to(&self, out: &mut impl Write) -> Result<()> {
        write_i32(out, self.unique_id)?;
        write_fixed_string(out, &self.dll, DLL_FIELD_LEN)?;
        write_fixed_string(out, &self.name, NAME_FIELD_LEN)?;
        write_fixed_string(out, &self.maker, MAKER_FIELD_LEN)?;
        out.write_all(&[u8::from(self.is_synth), u8::from(self.has_gui)])?;
        write_i32(out, self.input_count)?;
        write_i32(out, self.output_count)?;

        write_i32(out, self.parameters.len() as i32)?;
        for param in &self.parameters {
            write_fixed_string(out, &param.name, NAME_FIELD_LEN)?;
            out.write_all(&param.default_value.to_le_bytes())?;
        }

        write_i32(out, self.programs.len() as i32)?;
        for program in &self.programs {
            write_fixed_string(out, program, NAME_FIELD_LEN)?;
        }
        Ok(())
    }

    fn read_from(input: &mut impl Read) -> Result<Self> {
        let unique_id = read_i32(input)?;
        let dll = read_fixed_string(input, DLL_FIELD_LEN)?;
        let name = read_fixed_string(input, NAME_FIELD_LEN)?;
        let maker = read_fixed_string(input, MAKER_FIELD_LEN)?;

        let mut flags = [0u8; 2];
        input.read_exact(&mut flags)?;

        let input_count = read_i32(input)?;
        let output_count = read_i32(input)?;

        let param_count = read_non_negative_count(input, "parameter")?;
        let mut parameters = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            let name = read_fixed_string(input, NAME_FIELD_LEN)?;
            let mut float_buf = [0u8; 4];
            input.read_exact(&mut float_buf)?;
            parameters.push(ParameterCacheEntry {
                name,
                default_value: f32::from_le_bytes(float_buf),
            });
        }

        let program_count = read_non_negative_count(input, "program")?;
        let mut programs = Vec::with_capacity(program_count);
        for _ in 0..program_count {
            programs.push(read_fixed_string(input, NAME_FIELD_LEN)?);
        }

        Ok(Self {
            unique_id,
            dll,
            name,
            maker,
            input_count,
            output_count,
            is_synth: flags[0] != 0,
            has_gui: flags[1] != 0,
            parameters,
            programs,
        })
    }
}

/// Writes a whole cache: a version header followed by one variable-size
/// record per entry.
pub fn write_cache(out: &mut impl Write, entries: &[CacheEntry]) -> Result<()> {
    write_i32(out, CACHE_VERSION)?;
    write_i32(out, entries.len() as i32)?;
    for entry in entries {
        entry.write_to(out)?;
    }
    Ok(())
}

/// Reads a whole cache, rejecting a version it doesn't recognize rather
/// than guessing at a layout change.
pub fn read_cache(input: &mut impl Read) -> Result<Vec<CacheEntry>> {
    let version = read_i32(input)?;
    if version != CACHE_VERSION {
        return Err(Error::ProtocolViolation(format!(
            "unsupported scanner cache version {version}"
        )));
    }
    let count = read_non_negative_count(input, "cache entry")?;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(CacheEntry::read_from(input)?);
    }
    Ok(entries)
}
