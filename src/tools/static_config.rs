//! Static config synthesis tool
//!
//! Produces a component exporting `wasi:config/store@0.2.0-draft` that serves a
//! fixed set of key/value pairs. The pairs are baked into a data segment of a
//! generated core module together with a lookup table; `get` scans the table
//! and `get-all` returns it as-is. Output bytes depend only on the ordered
//! input pairs.

use super::Tool;
use anyhow::{Context, Result};
use std::fmt::Write as _;
use wit_component::{ComponentEncoder, StringEncoding};
use wit_parser::{Resolve, WorldId};

pub const BUILD_COMPONENT: &str = "build_component";

pub const STORE_INTERFACE: &str = "wasi:config/store@0.2.0-draft";

const WASI_CONFIG_WIT: &str = r#"
package wasi:config@0.2.0-draft;

interface store {
    variant error {
        upstream(string),
        io(string),
    }

    get: func(key: string) -> result<option<string>, error>;

    get-all: func() -> result<list<tuple<string, string>>, error>;
}
"#;

const STATIC_CONFIG_WIT: &str = r#"
package wacpack:static-config;

world static-config {
    export wasi:config/store@0.2.0-draft;
}
"#;

const WORLD: &str = "static-config";

// Fixed memory layout of the generated module.
const GET_RETURN_AREA: u32 = 0;
const GET_ALL_RETURN_AREA: u32 = 16;
const TABLE_OFFSET: u32 = 32;
const ENTRY_SIZE: u32 = 16;
const PAGE_SIZE: u32 = 65536;

/// Config synthesis tool holding the parsed WIT world
#[derive(Default)]
pub struct StaticConfigTool {
    world: Option<(Resolve, WorldId)>,
}

impl Tool for StaticConfigTool {
    fn call(&mut self, function: &str, input: &[u8]) -> Result<Vec<u8>> {
        match function {
            BUILD_COMPONENT => {
                let values: Vec<(String, String)> =
                    serde_json::from_slice(input).context("Invalid config values payload")?;
                self.build_component(&values)
            }
            other => anyhow::bail!("unknown function '{}'", other),
        }
    }
}

impl StaticConfigTool {
    /// Build a component serving `values` in the given order
    pub fn build_component(&mut self, values: &[(String, String)]) -> Result<Vec<u8>> {
        let module_text = generate_module(values)?;
        let mut module = wat::parse_str(&module_text).context("Failed to assemble config module")?;

        let (resolve, world) = self.world()?;
        wit_component::embed_component_metadata(&mut module, resolve, *world, StringEncoding::UTF8)
            .context("Failed to embed component metadata")?;

        let mut encoder = ComponentEncoder::default()
            .module(&module)
            .context("Failed to load config module")?
            .validate(true);
        encoder.encode().context("Failed to encode config component")
    }

    fn world(&mut self) -> Result<&(Resolve, WorldId)> {
        if self.world.is_none() {
            self.world = Some(load_world()?);
        }
        self.world
            .as_ref()
            .context("static-config world was not loaded")
    }
}

fn load_world() -> Result<(Resolve, WorldId)> {
    let mut resolve = Resolve::default();
    resolve
        .push_str("wasi-config.wit", WASI_CONFIG_WIT)
        .context("Failed to parse wasi:config WIT")?;
    let package = resolve
        .push_str("static-config.wit", STATIC_CONFIG_WIT)
        .context("Failed to parse static-config WIT")?;
    let world = resolve.packages[package]
        .worlds
        .get(WORLD)
        .copied()
        .with_context(|| format!("world '{}' not found", WORLD))?;
    Ok((resolve, world))
}

/// Lay out the table and string bytes placed at [`TABLE_OFFSET`]
///
/// Each table entry is `(key_ptr, key_len, value_ptr, value_len)` as
/// little-endian u32s, which is also the canonical ABI layout of
/// `tuple<string, string>`.
fn layout(values: &[(String, String)]) -> Result<Vec<u8>> {
    let count = u32::try_from(values.len()).context("too many config values")?;
    let strings_offset = TABLE_OFFSET + count * ENTRY_SIZE;

    let mut table = Vec::with_capacity(values.len() * ENTRY_SIZE as usize);
    let mut strings = Vec::new();
    for (key, value) in values {
        for s in [key, value] {
            let ptr = strings_offset + u32::try_from(strings.len()).context("config too large")?;
            let len = u32::try_from(s.len()).context("config value too large")?;
            table.extend_from_slice(&ptr.to_le_bytes());
            table.extend_from_slice(&len.to_le_bytes());
            strings.extend_from_slice(s.as_bytes());
        }
    }
    table.extend_from_slice(&strings);
    Ok(table)
}

fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for b in bytes {
        let _ = write!(out, "\\{:02x}", b);
    }
    out
}

fn generate_module(values: &[(String, String)]) -> Result<String> {
    let data = layout(values)?;
    let count = values.len();
    let data_end = TABLE_OFFSET + u32::try_from(data.len()).context("config too large")?;
    let heap_base = (data_end + 7) & !7;
    let pages = heap_base / PAGE_SIZE + 1;

    Ok(format!(
        r#"(module
  (memory (export "memory") {pages})
  (global $heap (mut i32) (i32.const {heap_base}))

  (func $eq (param $a i32) (param $b i32) (param $len i32) (result i32)
    (block $differ
      (loop $next
        local.get $len
        i32.eqz
        if
          i32.const 1
          return
        end
        local.get $a
        i32.load8_u
        local.get $b
        i32.load8_u
        i32.ne
        br_if $differ
        local.get $a
        i32.const 1
        i32.add
        local.set $a
        local.get $b
        i32.const 1
        i32.add
        local.set $b
        local.get $len
        i32.const 1
        i32.sub
        local.set $len
        br $next))
    i32.const 0)

  (func (export "{store}#get") (param $key i32) (param $key_len i32) (result i32)
    (local $i i32)
    (local $entry i32)
    i32.const {get_ret}
    i32.const 0
    i32.store8
    i32.const {get_ret}
    i32.const 0
    i32.store8 offset=4
    (block $done
      (loop $scan
        local.get $i
        i32.const {count}
        i32.ge_u
        br_if $done
        i32.const {table}
        local.get $i
        i32.const {entry_size}
        i32.mul
        i32.add
        local.set $entry
        local.get $entry
        i32.load offset=4
        local.get $key_len
        i32.eq
        if
          local.get $entry
          i32.load
          local.get $key
          local.get $key_len
          call $eq
          if
            i32.const {get_ret}
            i32.const 1
            i32.store8 offset=4
            i32.const {get_ret}
            local.get $entry
            i32.load offset=8
            i32.store offset=8
            i32.const {get_ret}
            local.get $entry
            i32.load offset=12
            i32.store offset=12
            br $done
          end
        end
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $scan))
    i32.const {get_ret})

  (func (export "{store}#get-all") (result i32)
    i32.const {get_all_ret}
    i32.const 0
    i32.store8
    i32.const {get_all_ret}
    i32.const {table}
    i32.store offset=4
    i32.const {get_all_ret}
    i32.const {count}
    i32.store offset=8
    i32.const {get_all_ret})

  (func (export "cabi_realloc") (param $old i32) (param $old_size i32) (param $align i32) (param $new_size i32) (result i32)
    (local $ptr i32)
    (local $i i32)
    global.get $heap
    local.get $align
    i32.add
    i32.const 1
    i32.sub
    i32.const 0
    local.get $align
    i32.sub
    i32.and
    local.set $ptr
    local.get $ptr
    local.get $new_size
    i32.add
    global.set $heap
    (block $fits
      (loop $grow
        global.get $heap
        memory.size
        i32.const 16
        i32.shl
        i32.le_u
        br_if $fits
        i32.const 1
        memory.grow
        i32.const -1
        i32.eq
        if
          unreachable
        end
        br $grow))
    (block $copied
      (loop $copy
        local.get $i
        local.get $old_size
        i32.ge_u
        br_if $copied
        local.get $i
        local.get $new_size
        i32.ge_u
        br_if $copied
        local.get $ptr
        local.get $i
        i32.add
        local.get $old
        local.get $i
        i32.add
        i32.load8_u
        i32.store8
        local.get $i
        i32.const 1
        i32.add
        local.set $i
        br $copy))
    local.get $ptr)

  (data (i32.const {table}) "{data}")
)
"#,
        pages = pages,
        heap_base = heap_base,
        store = STORE_INTERFACE,
        get_ret = GET_RETURN_AREA,
        get_all_ret = GET_ALL_RETURN_AREA,
        count = count,
        table = TABLE_OFFSET,
        entry_size = ENTRY_SIZE,
        data = escape(&data),
    ))
}
