use crate::blocks::{BlockNode, BlockTree, Literal};
use crate::value::Value;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;
use xmltree::Element;
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Sprite,
    Background,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostumeDoc {
    pub name: String,
    pub asset_id: String,
    pub md5ext: String,
    pub width: f64,
    pub height: f64,
    pub rotation_center_x: f64,
    pub rotation_center_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundDoc {
    pub name: String,
    pub asset_id: String,
    pub sample_count: u64,
    pub rate: u64,
}

impl SoundDoc {
    pub fn duration_secs(&self) -> f64 {
        if self.rate == 0 {
            return 0.0;
        }
        self.sample_count as f64 / self.rate as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDoc {
    pub name: String,
    pub value: Value,
    pub visible: bool,
    pub display_position: Option<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDoc {
    pub name: String,
    pub kind: EntityKind,
    pub x: f64,
    pub y: f64,
    pub direction: f64,
    /// Size in percent, 100 is the costume's natural size.
    pub size: f64,
    pub visible: bool,
    pub current_costume: usize,
    pub costumes: Vec<CostumeDoc>,
    pub sounds: Vec<SoundDoc>,
    pub variables: Vec<VariableDoc>,
    pub blocks: BlockTree,
}

impl EntityDoc {
    pub fn sprite(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: EntityKind::Sprite,
            x: 0.0,
            y: 0.0,
            direction: 90.0,
            size: 100.0,
            visible: true,
            current_costume: 0,
            costumes: Vec::new(),
            sounds: Vec::new(),
            variables: Vec::new(),
            blocks: BlockTree::new(),
        }
    }

    pub fn background(name: &str) -> Self {
        Self {
            kind: EntityKind::Background,
            ..Self::sprite(name)
        }
    }
}

/// The persisted project as far as the compiler and runtime care about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub entities: Vec<EntityDoc>,
}

impl ProjectDoc {
    pub fn entity_index(&self, name: &str) -> Option<usize> {
        self.entities
            .iter()
            .position(|e| e.name.eq_ignore_ascii_case(name))
    }
}

pub fn load_project(input: &Path) -> Result<ProjectDoc> {
    let is_json = input
        .extension()
        .and_then(|x| x.to_str())
        .map(|x| x.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if is_json {
        let text = fs::read_to_string(input)
            .with_context(|| format!("Failed to read '{}'.", input.display()))?;
        let project_json: Json = serde_json::from_str(&text)
            .with_context(|| format!("Invalid project.json '{}'.", input.display()))?;
        return parse_project_json(&project_json, &HashMap::new());
    }
    let bytes =
        fs::read(input).with_context(|| format!("Failed to open '{}'.", input.display()))?;
    let (project_json, assets) = read_sb3_bytes(&bytes)
        .with_context(|| format!("Failed to read project archive '{}'.", input.display()))?;
    parse_project_json(&project_json, &assets)
}

pub fn read_sb3_bytes(bytes: &[u8]) -> Result<(Json, HashMap<String, Vec<u8>>)> {
    let mut zip = ZipArchive::new(Cursor::new(bytes))
        .map_err(|_| anyhow!("Input is not a valid zip/.sb3 archive."))?;

    let mut project_json_str = String::new();
    zip.by_name("project.json")
        .map_err(|_| anyhow!("project.json not found in archive."))?
        .read_to_string(&mut project_json_str)?;
    let project_json: Json =
        serde_json::from_str(&project_json_str).context("Invalid project.json inside archive.")?;

    let mut assets = HashMap::new();
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let name = entry.name().to_string();
        if name == "project.json" || name.ends_with('/') {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        assets.insert(name, data);
    }
    Ok((project_json, assets))
}

pub fn parse_project_json(
    project_json: &Json,
    assets: &HashMap<String, Vec<u8>>,
) -> Result<ProjectDoc> {
    let targets = project_json
        .get("targets")
        .and_then(Json::as_array)
        .ok_or_else(|| anyhow!("Invalid project.json: missing 'targets' array."))?;

    let mut entities = Vec::new();
    for target in targets {
        entities.push(parse_target(target, assets)?);
    }
    // the background comes first so that sprite ids start at 1
    entities.sort_by_key(|e| if e.kind == EntityKind::Background { 0 } else { 1 });

    if let Some(monitors) = project_json.get("monitors").and_then(Json::as_array) {
        apply_monitors(&mut entities, monitors);
    }
    Ok(ProjectDoc { entities })
}

fn parse_target(target: &Json, assets: &HashMap<String, Vec<u8>>) -> Result<EntityDoc> {
    let name = target
        .get("name")
        .and_then(Json::as_str)
        .ok_or_else(|| anyhow!("Target missing 'name'."))?
        .to_string();
    let is_stage = target
        .get("isStage")
        .and_then(Json::as_bool)
        .ok_or_else(|| anyhow!("Target '{}' missing isStage.", name))?;
    let blocks = target
        .get("blocks")
        .and_then(Json::as_object)
        .ok_or_else(|| anyhow!("Target '{}' missing blocks object.", name))?;

    let number = |key: &str, fallback: f64| {
        target
            .get(key)
            .and_then(Json::as_f64)
            .unwrap_or(fallback)
    };

    Ok(EntityDoc {
        kind: if is_stage {
            EntityKind::Background
        } else {
            EntityKind::Sprite
        },
        x: number("x", 0.0),
        y: number("y", 0.0),
        direction: number("direction", 90.0),
        size: number("size", 100.0),
        visible: target
            .get("visible")
            .and_then(Json::as_bool)
            .unwrap_or(true),
        current_costume: target
            .get("currentCostume")
            .and_then(Json::as_u64)
            .unwrap_or(0) as usize,
        costumes: read_costumes(target.get("costumes"), assets)?,
        sounds: read_sounds(target.get("sounds")),
        variables: read_variables(target.get("variables")),
        blocks: convert_blocks(blocks),
        name,
    })
}

fn read_variables(node: Option<&Json>) -> Vec<VariableDoc> {
    let mut out = Vec::new();
    let Some(obj) = node.and_then(Json::as_object) else {
        return out;
    };
    for value in obj.values() {
        let Some(arr) = value.as_array() else {
            continue;
        };
        let Some(name) = arr.first().and_then(Json::as_str) else {
            continue;
        };
        let value = match arr.get(1) {
            Some(Json::Number(n)) => Value::Number(n.as_f64().unwrap_or(0.0)),
            Some(Json::Bool(b)) => Value::Bool(*b),
            Some(Json::String(s)) => Value::Text(s.clone()),
            _ => Value::Number(0.0),
        };
        out.push(VariableDoc {
            name: name.to_string(),
            value,
            visible: false,
            display_position: None,
        });
    }
    out
}

fn read_sounds(node: Option<&Json>) -> Vec<SoundDoc> {
    let mut out = Vec::new();
    let Some(arr) = node.and_then(Json::as_array) else {
        return out;
    };
    for sound in arr {
        let name = sound
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or("sound")
            .to_string();
        out.push(SoundDoc {
            asset_id: sound
                .get("assetId")
                .and_then(Json::as_str)
                .unwrap_or(&name)
                .to_string(),
            sample_count: sound.get("sampleCount").and_then(Json::as_u64).unwrap_or(0),
            rate: sound.get("rate").and_then(Json::as_u64).unwrap_or(0),
            name,
        });
    }
    out
}

fn read_costumes(node: Option<&Json>, assets: &HashMap<String, Vec<u8>>) -> Result<Vec<CostumeDoc>> {
    let mut out = Vec::new();
    let Some(arr) = node.and_then(Json::as_array) else {
        return Ok(out);
    };
    for (idx, costume) in arr.iter().enumerate() {
        let name = costume
            .get("name")
            .and_then(Json::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| format!("costume{}", idx + 1));
        let data_format = costume
            .get("dataFormat")
            .and_then(Json::as_str)
            .unwrap_or("svg")
            .to_lowercase();
        let declared_id = costume.get("assetId").and_then(Json::as_str);
        let md5ext = costume
            .get("md5ext")
            .and_then(Json::as_str)
            .map(ToString::to_string)
            .or_else(|| declared_id.map(|id| format!("{}.{}", id, data_format)))
            .unwrap_or_default();
        let center_x = costume
            .get("rotationCenterX")
            .and_then(Json::as_f64)
            .unwrap_or(0.0);
        let center_y = costume
            .get("rotationCenterY")
            .and_then(Json::as_f64)
            .unwrap_or(0.0);
        let resolution = costume
            .get("bitmapResolution")
            .and_then(Json::as_f64)
            .filter(|r| *r > 0.0)
            .unwrap_or(1.0);

        let data = assets.get(&md5ext);
        let asset_id = match (declared_id, data) {
            (Some(id), _) => id.to_string(),
            (None, Some(bytes)) => format!("{:x}", md5::compute(bytes)),
            (None, None) => name.clone(),
        };
        let (width, height) = match data {
            Some(bytes) => match costume_size(bytes, &data_format, &md5ext)? {
                Some((w, h)) => (w / resolution, h / resolution),
                None => (2.0 * center_x / resolution, 2.0 * center_y / resolution),
            },
            None => (2.0 * center_x / resolution, 2.0 * center_y / resolution),
        };
        out.push(CostumeDoc {
            name,
            asset_id,
            md5ext,
            width: width.max(0.0),
            height: height.max(0.0),
            rotation_center_x: center_x,
            rotation_center_y: center_y,
        });
    }
    Ok(out)
}

fn costume_size(data: &[u8], data_format: &str, source_name: &str) -> Result<Option<(f64, f64)>> {
    match data_format {
        "svg" => {
            let root = Element::parse(Cursor::new(data))
                .map_err(|e| anyhow!("Invalid SVG costume '{}': {}.", source_name, e))?;
            Ok(read_svg_size(&root))
        }
        "png" => Ok(read_png_size(data)),
        _ => Ok(None),
    }
}

fn read_svg_size(root: &Element) -> Option<(f64, f64)> {
    if let Some((w, h)) = root.attributes.get("viewBox").and_then(|v| parse_view_box(v)) {
        return Some((w, h));
    }
    let width = parse_svg_length(root.attributes.get("width").map(|s| s.as_str()));
    let height = parse_svg_length(root.attributes.get("height").map(|s| s.as_str()));
    match (width, height) {
        (Some(w), Some(h)) => Some((w, h)),
        _ => None,
    }
}

fn parse_view_box(view_box: &str) -> Option<(f64, f64)> {
    let parts = view_box
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<f64>().ok())
        .collect::<Option<Vec<_>>>()?;
    if parts.len() != 4 || parts[2] <= 0.0 || parts[3] <= 0.0 {
        return None;
    }
    Some((parts[2], parts[3]))
}

fn parse_svg_length(value: Option<&str>) -> Option<f64> {
    let s = value?.trim();
    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-'))
        .unwrap_or(s.len());
    let n = s[..end].parse::<f64>().ok()?;
    if n > 0.0 {
        Some(n)
    } else {
        None
    }
}

fn read_png_size(data: &[u8]) -> Option<(f64, f64)> {
    const SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";
    if data.len() < 24 || !data.starts_with(SIGNATURE) || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Some((f64::from(width), f64::from(height)))
}

fn apply_monitors(entities: &mut [EntityDoc], monitors: &[Json]) {
    for monitor in monitors {
        if monitor.get("opcode").and_then(Json::as_str) != Some("data_variable") {
            continue;
        }
        let Some(var_name) = monitor
            .get("params")
            .and_then(|p| p.get("VARIABLE"))
            .and_then(Json::as_str)
        else {
            continue;
        };
        let owner = monitor.get("spriteName").and_then(Json::as_str);
        let visible = monitor
            .get("visible")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        let position = match (
            monitor.get("x").and_then(Json::as_f64),
            monitor.get("y").and_then(Json::as_f64),
        ) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        };
        for entity in entities.iter_mut() {
            let owns = match owner {
                Some(sprite) => entity.name == sprite,
                None => entity.kind == EntityKind::Background,
            };
            if !owns {
                continue;
            }
            if let Some(var) = entity.variables.iter_mut().find(|v| v.name == var_name) {
                var.visible = visible;
                var.display_position = position;
            }
        }
    }
}

/// Converts the flat sb3 block map into a `BlockTree`, expanding compressed
/// literal inputs (`[4, "10"]`, `[10, "hi"]`, ...) into synthetic shadow nodes.
pub fn convert_blocks(blocks: &Map<String, Json>) -> BlockTree {
    let mut tree = BlockTree::new();
    for (id, block) in blocks {
        let Some(obj) = block.as_object() else {
            // top-level compressed reporters are editor leftovers
            continue;
        };
        let opcode = obj.get("opcode").and_then(Json::as_str).unwrap_or("");
        let mut node = BlockNode::new(id.clone(), opcode);
        node.top_level = obj
            .get("topLevel")
            .and_then(Json::as_bool)
            .unwrap_or(false);
        node.x = obj.get("x").and_then(Json::as_f64).unwrap_or(0.0);
        node.y = obj.get("y").and_then(Json::as_f64).unwrap_or(0.0);
        node.next = obj
            .get("next")
            .and_then(Json::as_str)
            .map(ToString::to_string);

        if let Some(fields) = obj.get("fields").and_then(Json::as_object) {
            for (name, value) in fields {
                if let Some(lit) = field_literal(value) {
                    node.fields.insert(name.clone(), lit);
                }
            }
        }

        if let Some(inputs) = obj.get("inputs").and_then(Json::as_object) {
            for (name, input) in inputs {
                let target = decode_input(&mut tree, id, name, input);
                if name.starts_with("SUBSTACK") {
                    node.statement_slots.insert(name.clone(), target);
                } else {
                    node.value_slots.insert(name.clone(), target);
                }
            }
        }
        tree.insert(node);
    }
    tree
}

fn field_literal(value: &Json) -> Option<Literal> {
    let first = match value {
        Json::Array(arr) => arr.first()?,
        other => other,
    };
    match first {
        Json::String(s) => Some(Literal::text(s.clone())),
        Json::Number(n) => Some(Literal::Number(n.as_f64().unwrap_or(0.0))),
        Json::Bool(b) => Some(Literal::Bool(*b)),
        _ => None,
    }
}

fn decode_input(tree: &mut BlockTree, parent: &str, slot: &str, input: &Json) -> Option<String> {
    if let Some(id) = input.as_str() {
        return Some(id.to_string());
    }
    let arr = input.as_array()?;
    let mode = arr.first().and_then(Json::as_i64).unwrap_or(1);
    let primary = arr.get(1);
    let shadow = arr.get(2);
    let resolve = |tree: &mut BlockTree, entry: Option<&Json>, suffix: &str| match entry {
        Some(Json::String(id)) => Some(id.clone()),
        Some(Json::Array(lit)) => expand_primitive(tree, &format!("{}:{}{}", parent, slot, suffix), lit),
        _ => None,
    };
    match mode {
        // obscured shadow: the reporter wins, the shadow is the fallback
        3 => resolve(tree, primary, "").or_else(|| resolve(tree, shadow, ":shadow")),
        _ => resolve(tree, primary, ""),
    }
}

fn expand_primitive(tree: &mut BlockTree, id: &str, lit: &[Json]) -> Option<String> {
    let code = lit.first().and_then(Json::as_i64)?;
    let raw = lit.get(1)?;
    let text = match raw {
        Json::String(s) => s.clone(),
        Json::Number(n) => n.to_string(),
        _ => String::new(),
    };
    let node = match code {
        4..=8 => {
            let mut node = BlockNode::new(id, "math_number");
            let lit = crate::value::parse_number(&text)
                .map(Literal::Number)
                .unwrap_or(Literal::Text(text));
            node.fields.insert("NUM".to_string(), lit);
            node
        }
        9 | 10 => {
            let mut node = BlockNode::new(id, "text");
            node.fields.insert("TEXT".to_string(), Literal::Text(text));
            node
        }
        11 => {
            let mut node = BlockNode::new(id, "event_broadcast_menu");
            node.fields
                .insert("BROADCAST_OPTION".to_string(), Literal::Text(text));
            node
        }
        12 => {
            let mut node = BlockNode::new(id, "data_variable");
            node.fields.insert("VARIABLE".to_string(), Literal::Text(text));
            node
        }
        _ => return None,
    };
    tree.insert(node);
    Some(id.to_string())
}
