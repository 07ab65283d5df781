// 🏙️ City Models - CityJSON read/write with self-contained building records
//
// On load every building (root CityObject + descendants) gets its own vertex
// list in real-world coordinates, so it can move between models. On save the
// vertex lists are concatenated and re-quantised against one transform.

use crate::error::{ChangeError, Result};
use crate::grid::BuildingId;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use tracing::warn;

/// Output quantisation when the source model has no transform (millimetres)
const DEFAULT_SCALE: [f64; 3] = [0.001, 0.001, 0.001];

// ============================================================================
// BUILDING RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CityModelBuilding {
    id: BuildingId,

    /// Root object first, then descendants; boundaries index into `vertices`
    objects: Map<String, Value>,

    vertices: Vec<[f64; 3]>,
}

impl CityModelBuilding {
    pub fn id(&self) -> &BuildingId {
        &self.id
    }

    pub fn root(&self) -> Option<&Value> {
        self.objects.get(self.id.as_str())
    }

    pub fn object_type(&self) -> Option<&str> {
        self.root().and_then(|r| r.get("type")).and_then(Value::as_str)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &String> {
        self.objects.keys()
    }

    pub fn vertices(&self) -> &[[f64; 3]] {
        &self.vertices
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.root()
            .and_then(|r| r.get("attributes"))
            .and_then(|a| a.get(key))
    }

    /// Set an attribute on the root object, creating the attribute map if needed
    pub fn set_attribute(&mut self, key: &str, value: Value) {
        let Some(root) = self.objects.get_mut(self.id.as_str()).and_then(Value::as_object_mut) else {
            return;
        };
        let attributes = root
            .entry("attributes")
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(map) = attributes.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

// ============================================================================
// CITY MODEL
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct CityModel {
    pub version: String,
    pub metadata: Option<Value>,
    pub extensions: Option<Value>,

    /// Quantisation scale of the source transform, reused on save
    pub scale: Option<[f64; 3]>,

    buildings: BTreeMap<BuildingId, CityModelBuilding>,
}

impl CityModel {
    /// Same header, no buildings
    pub fn empty_like(other: &CityModel) -> Self {
        CityModel {
            version: other.version.clone(),
            metadata: other.metadata.clone(),
            extensions: other.extensions.clone(),
            scale: other.scale,
            buildings: BTreeMap::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let doc: Value = serde_json::from_str(&content)?;
        Self::from_value(doc)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string(&self.to_value()?)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buildings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buildings.is_empty()
    }

    pub fn get(&self, id: &BuildingId) -> Option<&CityModelBuilding> {
        self.buildings.get(id)
    }

    pub fn contains(&self, id: &BuildingId) -> bool {
        self.buildings.contains_key(id)
    }

    pub fn building_ids(&self) -> impl Iterator<Item = &BuildingId> {
        self.buildings.keys()
    }

    pub fn buildings(&self) -> impl Iterator<Item = &CityModelBuilding> {
        self.buildings.values()
    }

    pub fn insert(&mut self, building: CityModelBuilding) {
        self.buildings.insert(building.id.clone(), building);
    }

    /// Declared reference system string, e.g. `https://www.opengis.net/def/crs/EPSG/0/7415`
    pub fn reference_system(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("referenceSystem"))
            .and_then(Value::as_str)
    }

    /// EPSG code parsed from the trailing digits of the reference system
    pub fn epsg(&self) -> Option<u32> {
        let crs = self.reference_system()?;
        let digits: String = crs
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }

    // ========================================================================
    // DECODE
    // ========================================================================

    pub fn from_value(doc: Value) -> Result<Self> {
        let Value::Object(mut doc) = doc else {
            return Err(ChangeError::CityModel("document is not a JSON object".to_string()));
        };

        if doc.get("type").and_then(Value::as_str) != Some("CityJSON") {
            return Err(ChangeError::CityModel("type must be \"CityJSON\"".to_string()));
        }

        let version = doc
            .get("version")
            .and_then(Value::as_str)
            .ok_or_else(|| ChangeError::CityModel("missing version".to_string()))?
            .to_string();

        let (scale, translate) = match doc.get("transform") {
            Some(t) => (Some(read_triplet(t, "scale")?), read_triplet(t, "translate")?),
            None => (None, [0.0; 3]),
        };

        let vertices = read_vertices(doc.get("vertices"), scale.unwrap_or([1.0; 3]), translate)?;

        let objects = match doc.remove("CityObjects") {
            Some(Value::Object(objects)) => objects,
            _ => return Err(ChangeError::CityModel("missing CityObjects".to_string())),
        };

        if doc.contains_key("geometry-templates") {
            warn!("geometry templates are not carried over; GeometryInstance geometries are dropped");
        }

        let mut buildings = BTreeMap::new();
        for root_id in root_ids(&objects) {
            let building = collect_building(&root_id, &objects, &vertices)?;
            buildings.insert(building.id.clone(), building);
        }

        Ok(CityModel {
            version,
            metadata: doc.remove("metadata"),
            extensions: doc.remove("extensions"),
            scale,
            buildings,
        })
    }

    // ========================================================================
    // ENCODE
    // ========================================================================

    pub fn to_value(&self) -> Result<Value> {
        let scale = self.scale.unwrap_or(DEFAULT_SCALE);

        let mut translate = [f64::INFINITY; 3];
        let mut upper = [f64::NEG_INFINITY; 3];
        for building in self.buildings.values() {
            for v in &building.vertices {
                for axis in 0..3 {
                    translate[axis] = translate[axis].min(v[axis]);
                    upper[axis] = upper[axis].max(v[axis]);
                }
            }
        }
        let extent = if translate.iter().all(|t| t.is_finite()) {
            Some([translate[0], translate[1], translate[2], upper[0], upper[1], upper[2]])
        } else {
            translate = [0.0; 3];
            None
        };

        let mut objects = Map::new();
        let mut vertices = Vec::new();

        for building in self.buildings.values() {
            let offset = vertices.len() as u64;
            for v in &building.vertices {
                let mut quantised = [0i64; 3];
                for axis in 0..3 {
                    quantised[axis] = ((v[axis] - translate[axis]) / scale[axis]).round() as i64;
                }
                vertices.push(json!(quantised));
            }

            for (object_id, object) in &building.objects {
                let mut object = object.clone();
                for_each_boundary(&mut object, |boundaries| {
                    remap_indices(boundaries, &mut |local| Ok(local + offset))
                })?;
                objects.insert(object_id.clone(), object);
            }
        }

        let mut doc = Map::new();
        doc.insert("type".to_string(), json!("CityJSON"));
        doc.insert("version".to_string(), json!(self.version));
        doc.insert(
            "transform".to_string(),
            json!({ "scale": scale, "translate": translate }),
        );
        if let Some(metadata) = &self.metadata {
            let mut metadata = metadata.clone();
            // a declared extent must describe the buildings actually written
            if let Some(fields) = metadata.as_object_mut() {
                if fields.contains_key("geographicalExtent") {
                    match extent {
                        Some(extent) => {
                            fields.insert("geographicalExtent".to_string(), json!(extent));
                        }
                        None => {
                            fields.remove("geographicalExtent");
                        }
                    }
                }
            }
            doc.insert("metadata".to_string(), metadata);
        }
        if let Some(extensions) = &self.extensions {
            doc.insert("extensions".to_string(), extensions.clone());
        }
        doc.insert("CityObjects".to_string(), Value::Object(objects));
        doc.insert("vertices".to_string(), Value::Array(vertices));

        Ok(Value::Object(doc))
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn read_triplet(transform: &Value, key: &str) -> Result<[f64; 3]> {
    let values = transform
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| ChangeError::CityModel(format!("transform.{} missing", key)))?;
    if values.len() != 3 {
        return Err(ChangeError::CityModel(format!("transform.{} must have 3 values", key)));
    }
    let mut out = [0.0; 3];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value
            .as_f64()
            .ok_or_else(|| ChangeError::CityModel(format!("transform.{} is not numeric", key)))?;
    }
    Ok(out)
}

fn read_vertices(raw: Option<&Value>, scale: [f64; 3], translate: [f64; 3]) -> Result<Vec<[f64; 3]>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let list = raw
        .as_array()
        .ok_or_else(|| ChangeError::CityModel("vertices must be an array".to_string()))?;

    list.iter()
        .enumerate()
        .map(|(i, v)| {
            let coords = v.as_array().filter(|c| c.len() == 3).ok_or_else(|| {
                ChangeError::CityModel(format!("vertex {} must have 3 coordinates", i))
            })?;
            let mut out = [0.0; 3];
            for axis in 0..3 {
                let c = coords[axis].as_f64().ok_or_else(|| {
                    ChangeError::CityModel(format!("vertex {} has a non-numeric coordinate", i))
                })?;
                out[axis] = c * scale[axis] + translate[axis];
            }
            Ok(out)
        })
        .collect()
}

/// Objects whose parents are all absent from the document are building roots
fn root_ids(objects: &Map<String, Value>) -> Vec<String> {
    objects
        .iter()
        .filter(|(_, object)| {
            let parents = object.get("parents").and_then(Value::as_array);
            match parents {
                Some(parents) => !parents
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|p| objects.contains_key(p)),
                None => true,
            }
        })
        .map(|(id, _)| id.clone())
        .collect()
}

fn collect_building(
    root_id: &str,
    objects: &Map<String, Value>,
    vertices: &[[f64; 3]],
) -> Result<CityModelBuilding> {
    let mut members = Map::new();
    let mut seen = BTreeSet::new();
    let mut stack = vec![root_id.to_string()];

    let mut local_index: HashMap<u64, u64> = HashMap::new();
    let mut local_vertices: Vec<[f64; 3]> = Vec::new();

    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(object) = objects.get(&id) else {
            warn!(building = root_id, child = %id, "referenced child object is missing");
            continue;
        };

        if let Some(children) = object.get("children").and_then(Value::as_array) {
            for child in children.iter().rev().filter_map(Value::as_str) {
                stack.push(child.to_string());
            }
        }

        let mut object = object.clone();
        drop_unsupported_geometry(&id, &mut object);

        for_each_boundary(&mut object, |boundaries| {
            remap_indices(boundaries, &mut |global| {
                if let Some(local) = local_index.get(&global) {
                    return Ok(*local);
                }
                let vertex = vertices.get(global as usize).ok_or_else(|| {
                    ChangeError::CityModel(format!(
                        "object {} references vertex {} of {}",
                        id,
                        global,
                        vertices.len()
                    ))
                })?;
                local_vertices.push(*vertex);
                let local = (local_vertices.len() - 1) as u64;
                local_index.insert(global, local);
                Ok(local)
            })
        })?;

        members.insert(id, object);
    }

    Ok(CityModelBuilding {
        id: BuildingId::new(root_id),
        objects: members,
        vertices: local_vertices,
    })
}

/// Appearance and template references point outside the building; strip them
fn drop_unsupported_geometry(id: &str, object: &mut Value) {
    let Some(geometries) = object.get_mut("geometry").and_then(Value::as_array_mut) else {
        return;
    };

    let before = geometries.len();
    geometries.retain(|g| g.get("type").and_then(Value::as_str) != Some("GeometryInstance"));
    if geometries.len() != before {
        warn!(object = id, dropped = before - geometries.len(), "dropped GeometryInstance geometries");
    }

    for geometry in geometries.iter_mut() {
        if let Some(g) = geometry.as_object_mut() {
            g.remove("texture");
            g.remove("material");
        }
    }
}

fn for_each_boundary<F>(object: &mut Value, mut f: F) -> Result<()>
where
    F: FnMut(&mut Value) -> Result<()>,
{
    if let Some(geometries) = object.get_mut("geometry").and_then(Value::as_array_mut) {
        for geometry in geometries {
            if let Some(boundaries) = geometry.get_mut("boundaries") {
                f(boundaries)?;
            }
        }
    }
    Ok(())
}

/// Rewrite every vertex index in a (nested) boundary array
fn remap_indices<F>(value: &mut Value, f: &mut F) -> Result<()>
where
    F: FnMut(u64) -> Result<u64>,
{
    if let Some(index) = value.as_u64() {
        *value = Value::from(f(index)?);
        return Ok(());
    }

    match value {
        Value::Array(items) => {
            for item in items {
                remap_indices(item, f)?;
            }
            Ok(())
        }
        other => Err(ChangeError::CityModel(format!(
            "unexpected boundary element {}",
            other
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two buildings: "B1" with a BuildingPart "B1-0", and "B2" without parts.
    pub(crate) fn sample_doc(translate_x: f64, height: i64) -> Value {
        json!({
            "type": "CityJSON",
            "version": "1.1",
            "transform": { "scale": [0.01, 0.01, 0.01], "translate": [translate_x, 447000.0, 0.0] },
            "metadata": { "referenceSystem": "https://www.opengis.net/def/crs/EPSG/0/7415" },
            "CityObjects": {
                "B1": {
                    "type": "Building",
                    "attributes": { "oorspronkelijkbouwjaar": 1932 },
                    "children": ["B1-0"]
                },
                "B1-0": {
                    "type": "BuildingPart",
                    "parents": ["B1"],
                    "geometry": [{
                        "type": "MultiSurface",
                        "lod": "1.2",
                        "boundaries": [[[0, 1, 2]], [[0, 2, 3]]],
                        "semantics": { "surfaces": [{ "type": "RoofSurface" }], "values": [0, 0] }
                    }]
                },
                "B2": {
                    "type": "Building",
                    "geometry": [{
                        "type": "MultiSurface",
                        "lod": "1.2",
                        "boundaries": [[[4, 5, 6]]]
                    }]
                }
            },
            "vertices": [
                [0, 0, height], [100, 0, height], [100, 100, height], [0, 100, height],
                [500, 500, 0], [600, 500, 0], [600, 600, 0]
            ]
        })
    }

    #[test]
    fn test_load_groups_parts_under_root() {
        let model = CityModel::from_value(sample_doc(85000.0, 300)).unwrap();

        assert_eq!(model.len(), 2);
        assert_eq!(model.epsg(), Some(7415));
        assert_eq!(model.version, "1.1");

        let b1 = model.get(&BuildingId::new("B1")).unwrap();
        assert_eq!(b1.object_type(), Some("Building"));
        let ids: Vec<&String> = b1.object_ids().collect();
        assert_eq!(ids, vec!["B1", "B1-0"]);
        assert_eq!(b1.vertices().len(), 4);
        assert_eq!(b1.vertices()[2], [85001.0, 447001.0, 3.0]);
        assert_eq!(b1.attribute("oorspronkelijkbouwjaar"), Some(&json!(1932)));

        let b2 = model.get(&BuildingId::new("B2")).unwrap();
        assert_eq!(b2.vertices().len(), 3);
        assert_eq!(b2.vertices()[0], [85005.0, 447005.0, 0.0]);
    }

    #[test]
    fn test_boundaries_are_building_local() {
        let model = CityModel::from_value(sample_doc(85000.0, 300)).unwrap();
        let b2 = model.get(&BuildingId::new("B2")).unwrap();
        let boundaries = &b2.root().unwrap()["geometry"][0]["boundaries"];
        assert_eq!(boundaries, &json!([[[0, 1, 2]]]));
    }

    #[test]
    fn test_round_trip_keeps_real_coordinates() {
        let a = CityModel::from_value(sample_doc(85000.0, 300)).unwrap();
        let b = CityModel::from_value(sample_doc(84000.0, 900)).unwrap();

        // Mix buildings from models with different transforms
        let mut merged = CityModel::empty_like(&a);
        merged.insert(b.get(&BuildingId::new("B1")).unwrap().clone());
        merged.insert(a.get(&BuildingId::new("B2")).unwrap().clone());

        let reloaded = CityModel::from_value(merged.to_value().unwrap()).unwrap();
        let b1 = reloaded.get(&BuildingId::new("B1")).unwrap();
        let b2 = reloaded.get(&BuildingId::new("B2")).unwrap();

        let close = |p: [f64; 3], q: [f64; 3]| p.iter().zip(q).all(|(x, y)| (x - y).abs() < 0.006);
        assert!(close(b1.vertices()[2], [84001.0, 447001.0, 9.0]));
        assert!(close(b2.vertices()[0], [85005.0, 447005.0, 0.0]));
        assert_eq!(b1.object_ids().count(), 2);
    }

    #[test]
    fn test_geographical_extent_follows_written_buildings() {
        let mut doc = sample_doc(85000.0, 300);
        doc["metadata"]["geographicalExtent"] = json!([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let model = CityModel::from_value(doc).unwrap();

        let mut subset = CityModel::empty_like(&model);
        subset.insert(model.get(&BuildingId::new("B1")).unwrap().clone());
        let written = subset.to_value().unwrap();
        assert_eq!(
            written["metadata"]["geographicalExtent"],
            json!([85000.0, 447000.0, 3.0, 85001.0, 447001.0, 3.0])
        );
        assert_eq!(
            written["metadata"]["referenceSystem"],
            json!("https://www.opengis.net/def/crs/EPSG/0/7415")
        );

        let empty = CityModel::empty_like(&model).to_value().unwrap();
        assert!(empty["metadata"].get("geographicalExtent").is_none());

        // no extent declared, none invented
        let plain = CityModel::from_value(sample_doc(85000.0, 300)).unwrap().to_value().unwrap();
        assert!(plain["metadata"].get("geographicalExtent").is_none());
    }

    #[test]
    fn test_texture_is_not_carried() {
        let mut doc = sample_doc(0.0, 0);
        doc["CityObjects"]["B2"]["geometry"][0]["texture"] = json!({ "summer": { "values": [[[0, 1, 2, 3]]] } });
        let model = CityModel::from_value(doc).unwrap();
        let root = model.get(&BuildingId::new("B2")).unwrap().root().unwrap();
        assert!(root["geometry"][0].get("texture").is_none());
    }

    #[test]
    fn test_set_attribute() {
        let model = CityModel::from_value(sample_doc(0.0, 0)).unwrap();
        let mut b2 = model.get(&BuildingId::new("B2")).unwrap().clone();
        b2.set_attribute("change_provenance", json!("changed-replaced"));
        assert_eq!(b2.attribute("change_provenance"), Some(&json!("changed-replaced")));
        // The source model is untouched
        assert!(model.get(&BuildingId::new("B2")).unwrap().attribute("change_provenance").is_none());
    }

    #[test]
    fn test_rejects_bad_documents() {
        assert!(CityModel::from_value(json!({ "type": "FeatureCollection" })).is_err());
        assert!(CityModel::from_value(json!({ "type": "CityJSON", "version": "1.1" })).is_err());

        let mut doc = sample_doc(0.0, 0);
        doc["CityObjects"]["B2"]["geometry"][0]["boundaries"] = json!([[[4, 5, 99]]]);
        assert!(matches!(CityModel::from_value(doc), Err(ChangeError::CityModel(_))));
    }

    #[test]
    fn test_save_and_load_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("model.city.json");
        let model = CityModel::from_value(sample_doc(85000.0, 300)).unwrap();

        model.save(&path).unwrap();
        let loaded = CityModel::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.reference_system(), model.reference_system());
    }
}
