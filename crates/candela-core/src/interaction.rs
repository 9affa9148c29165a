use serde::{Deserialize, Serialize};

/// Enumerated request verbs handled by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Interaction {
    InstanceRead,
    InstanceUpdate,
    InstanceUpdateConditional,
    InstanceDelete,
    InstanceOperation,
    TypeCreate,
    TypeCreateConditional,
    TypeDeleteConditionalSingle,
    TypeDeleteConditionalMultiple,
    TypeSearch,
    TypeOperation,
    SystemCapabilities,
    SystemBundle,
    SystemDeleteConditional,
    SystemOperation,
    SystemSearch,
    CompartmentSearch,
    CompartmentTypeSearch,
}

impl Interaction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstanceRead => "instance-read",
            Self::InstanceUpdate => "instance-update",
            Self::InstanceUpdateConditional => "instance-update-conditional",
            Self::InstanceDelete => "instance-delete",
            Self::InstanceOperation => "instance-operation",
            Self::TypeCreate => "type-create",
            Self::TypeCreateConditional => "type-create-conditional",
            Self::TypeDeleteConditionalSingle => "type-delete-conditional-single",
            Self::TypeDeleteConditionalMultiple => "type-delete-conditional-multiple",
            Self::TypeSearch => "type-search",
            Self::TypeOperation => "type-operation",
            Self::SystemCapabilities => "system-capabilities",
            Self::SystemBundle => "system-bundle",
            Self::SystemDeleteConditional => "system-delete-conditional",
            Self::SystemOperation => "system-operation",
            Self::SystemSearch => "system-search",
            Self::CompartmentSearch => "compartment-search",
            Self::CompartmentTypeSearch => "compartment-type-search",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "instance-read" => Some(Self::InstanceRead),
            "instance-update" => Some(Self::InstanceUpdate),
            "instance-update-conditional" => Some(Self::InstanceUpdateConditional),
            "instance-delete" => Some(Self::InstanceDelete),
            "instance-operation" => Some(Self::InstanceOperation),
            "type-create" => Some(Self::TypeCreate),
            "type-create-conditional" => Some(Self::TypeCreateConditional),
            "type-delete-conditional-single" => Some(Self::TypeDeleteConditionalSingle),
            "type-delete-conditional-multiple" => Some(Self::TypeDeleteConditionalMultiple),
            "type-search" => Some(Self::TypeSearch),
            "type-operation" => Some(Self::TypeOperation),
            "system-capabilities" => Some(Self::SystemCapabilities),
            "system-bundle" => Some(Self::SystemBundle),
            "system-delete-conditional" => Some(Self::SystemDeleteConditional),
            "system-operation" => Some(Self::SystemOperation),
            "system-search" => Some(Self::SystemSearch),
            "compartment-search" => Some(Self::CompartmentSearch),
            "compartment-type-search" => Some(Self::CompartmentTypeSearch),
            _ => None,
        }
    }

    /// True when the interaction mutates stored state.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Self::InstanceUpdate
                | Self::InstanceUpdateConditional
                | Self::InstanceDelete
                | Self::TypeCreate
                | Self::TypeCreateConditional
                | Self::TypeDeleteConditionalSingle
                | Self::TypeDeleteConditionalMultiple
                | Self::SystemBundle
                | Self::SystemDeleteConditional
        )
    }

    /// True when the interaction requires a kind in the request context.
    pub fn requires_kind(&self) -> bool {
        !matches!(
            self,
            Self::SystemCapabilities
                | Self::SystemBundle
                | Self::SystemDeleteConditional
                | Self::SystemOperation
                | Self::SystemSearch
        )
    }
}

impl std::fmt::Display for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
