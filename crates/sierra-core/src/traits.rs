//! Organization scoping.

use crate::ids::OrganizationId;

/// Entity owned by exactly one organization.
///
/// Handlers use this to refuse cross-organization reads without caring about
/// the concrete entity type.
///
/// # Example
///
/// ```
/// use sierra_core::{OrganizationId, OrganizationScoped};
///
/// struct Ticket {
///     organization_id: OrganizationId,
/// }
///
/// impl OrganizationScoped for Ticket {
///     fn organization_id(&self) -> OrganizationId {
///         self.organization_id
///     }
/// }
///
/// let org = OrganizationId::new();
/// let ticket = Ticket { organization_id: org };
/// assert!(ticket.belongs_to(org));
/// assert!(!ticket.belongs_to(OrganizationId::new()));
/// ```
pub trait OrganizationScoped {
    /// Returns the owning organization.
    fn organization_id(&self) -> OrganizationId;

    /// Returns `true` if the entity is owned by `organization_id`.
    fn belongs_to(&self, organization_id: OrganizationId) -> bool {
        self.organization_id() == organization_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scoped(OrganizationId);

    impl OrganizationScoped for Scoped {
        fn organization_id(&self) -> OrganizationId {
            self.0
        }
    }

    #[test]
    fn test_belongs_to_matches_owner_only() {
        let org = OrganizationId::new();
        let entity = Scoped(org);
        assert!(entity.belongs_to(org));
        assert!(!entity.belongs_to(OrganizationId::new()));
    }

    #[test]
    fn test_trait_is_object_safe() {
        let org = OrganizationId::new();
        let boxed: Box<dyn OrganizationScoped> = Box::new(Scoped(org));
        assert_eq!(boxed.organization_id(), org);
    }
}
