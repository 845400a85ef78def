/// HELLO feature negotiation codes.
///
/// The client sends the set it wants as 2-byte big-endian codes in the
/// HELLO body; the server echoes back the subset it honors.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Datatype,
    TcpNodelay,
    MutationSeqno,
    Xattr,
    Xerror,
    SelectBucket,
    Snappy,
    Json,
    Duplex,
    ClustermapChangeNotification,
    UnorderedExecution,
    Collections,
    Other(u16),
}

impl Feature {
    pub fn from_code(code: u16) -> Self {
        match code {
            0x01 => Self::Datatype,
            0x03 => Self::TcpNodelay,
            0x04 => Self::MutationSeqno,
            0x06 => Self::Xattr,
            0x07 => Self::Xerror,
            0x08 => Self::SelectBucket,
            0x0a => Self::Snappy,
            0x0b => Self::Json,
            0x0c => Self::Duplex,
            0x0d => Self::ClustermapChangeNotification,
            0x0e => Self::UnorderedExecution,
            0x12 => Self::Collections,
            other => Self::Other(other),
        }
    }

    pub fn to_code(self) -> u16 {
        match self {
            Self::Datatype => 0x01,
            Self::TcpNodelay => 0x03,
            Self::MutationSeqno => 0x04,
            Self::Xattr => 0x06,
            Self::Xerror => 0x07,
            Self::SelectBucket => 0x08,
            Self::Snappy => 0x0a,
            Self::Json => 0x0b,
            Self::Duplex => 0x0c,
            Self::ClustermapChangeNotification => 0x0d,
            Self::UnorderedExecution => 0x0e,
            Self::Collections => 0x12,
            Self::Other(code) => code,
        }
    }
}

/// The set of features honored by (or requested from) a server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureSet {
    features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    /// The default request set for a DCP producer connection.
    pub fn default_request() -> Self {
        Self::new(vec![
            Feature::TcpNodelay,
            Feature::Xattr,
            Feature::Xerror,
            Feature::SelectBucket,
            Feature::ClustermapChangeNotification,
            Feature::Collections,
        ])
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    pub fn push(&mut self, feature: Feature) {
        if !self.contains(feature) {
            self.features.push(feature);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.features.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Encode as a HELLO request body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.features.len() * 2);
        for feature in &self.features {
            buf.extend_from_slice(&feature.to_code().to_be_bytes());
        }
        buf
    }

    /// Parse the honored subset from a HELLO response body.
    pub fn parse(body: &[u8]) -> Self {
        let features = body
            .chunks_exact(2)
            .map(|pair| Feature::from_code(u16::from_be_bytes([pair[0], pair[1]])))
            .collect();
        Self { features }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_set_roundtrip() {
        let set = FeatureSet::default_request();
        let parsed = FeatureSet::parse(&set.encode());
        assert_eq!(parsed, set);
    }

    #[test]
    fn test_parse_ignores_trailing_odd_byte() {
        let parsed = FeatureSet::parse(&[0x00, 0x03, 0xff]);
        assert!(parsed.contains(Feature::TcpNodelay));
        assert_eq!(parsed.iter().count(), 1);
    }
}
