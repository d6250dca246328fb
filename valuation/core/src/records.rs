use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Scalar value carried by a request record or a reference row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Integral value.
    Int(i64),
    /// Floating point value.
    Float(f64),
    /// Text value (region codes, free-form columns).
    Text(String),
    /// Explicit null; treated as absent by the aligner.
    Null,
}

impl FeatureValue {
    /// Numeric view of the value. `None` for null or for text that is not a number.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Int(value) => Some(*value as f64),
            Self::Float(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
            Self::Null => None,
        }
    }

    /// Join-key view of the value; text is used verbatim so leading zeros survive.
    #[must_use]
    pub fn as_key(&self) -> Option<String> {
        match self {
            Self::Text(text) => Some(text.clone()),
            Self::Int(value) => Some(value.to_string()),
            Self::Float(value) => Some(value.to_string()),
            Self::Null => None,
        }
    }

    /// Returns true for [`FeatureValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One entity to be priced: feature name to scalar, in insertion order.
pub type FeatureRecord = IndexMap<String, FeatureValue>;

/// Endpoint variant a prediction was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    /// Full feature payload.
    Full,
    /// Minimal feature payload enriched from reference data.
    Minimal,
}

impl EndpointType {
    /// Wire label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Minimal => "minimal",
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimal payload: structural attributes plus the region code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinimalHouseFeatures {
    /// Number of bedrooms.
    pub bedrooms: i64,
    /// Number of bathrooms (fractional counts allowed).
    pub bathrooms: f64,
    /// Living area in square feet.
    pub sqft_living: i64,
    /// Lot area in square feet.
    pub sqft_lot: i64,
    /// Number of floors.
    pub floors: f64,
    /// Area above ground in square feet.
    pub sqft_above: i64,
    /// Basement area in square feet.
    pub sqft_basement: i64,
    /// Region code, kept as text.
    pub zipcode: String,
}

/// Full payload: the minimal prefix plus ten property attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullHouseFeatures {
    /// Shared minimal prefix.
    #[serde(flatten)]
    pub base: MinimalHouseFeatures,
    /// Waterfront flag.
    pub waterfront: i64,
    /// View rating.
    pub view: i64,
    /// Condition rating.
    pub condition: i64,
    /// Construction grade.
    pub grade: i64,
    /// Year built.
    pub yr_built: i64,
    /// Year renovated, 0 when never renovated.
    pub yr_renovated: i64,
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub long: f64,
    /// Living area of the 15 nearest neighbours.
    pub sqft_living15: i64,
    /// Lot area of the 15 nearest neighbours.
    pub sqft_lot15: i64,
}

impl From<MinimalHouseFeatures> for FeatureRecord {
    fn from(features: MinimalHouseFeatures) -> Self {
        let mut record = Self::with_capacity(18);
        record.insert("bedrooms".into(), features.bedrooms.into());
        record.insert("bathrooms".into(), features.bathrooms.into());
        record.insert("sqft_living".into(), features.sqft_living.into());
        record.insert("sqft_lot".into(), features.sqft_lot.into());
        record.insert("floors".into(), features.floors.into());
        record.insert("sqft_above".into(), features.sqft_above.into());
        record.insert("sqft_basement".into(), features.sqft_basement.into());
        record.insert("zipcode".into(), features.zipcode.into());
        record
    }
}

impl From<FullHouseFeatures> for FeatureRecord {
    fn from(features: FullHouseFeatures) -> Self {
        let mut record = Self::from(features.base);
        record.insert("waterfront".into(), features.waterfront.into());
        record.insert("view".into(), features.view.into());
        record.insert("condition".into(), features.condition.into());
        record.insert("grade".into(), features.grade.into());
        record.insert("yr_built".into(), features.yr_built.into());
        record.insert("yr_renovated".into(), features.yr_renovated.into());
        record.insert("lat".into(), features.lat.into());
        record.insert("long".into(), features.long.into());
        record.insert("sqft_living15".into(), features.sqft_living15.into());
        record.insert("sqft_lot15".into(), features.sqft_lot15.into());
        record
    }
}

/// Request payload shape served by one prediction endpoint.
pub trait HousePayload: Into<FeatureRecord> {
    /// Endpoint variant recorded in the ledger for this shape.
    const ENDPOINT: EndpointType;
}

impl HousePayload for MinimalHouseFeatures {
    const ENDPOINT: EndpointType = EndpointType::Minimal;
}

impl HousePayload for FullHouseFeatures {
    const ENDPOINT: EndpointType = EndpointType::Full;
}
