use crate::config::CapacityTemplate;
use crate::config::ChipFamilyConfig;

/// Number of virtual slots one physical device offers.
///
/// `templates` must be sorted ascending by memory; the smallest template is the
/// slot unit. Without templates the device is handed out whole.
pub fn virtual_slots(allocatable_memory: u64, templates: &[CapacityTemplate], limit: u32) -> u32 {
    let Some(smallest) = templates.first() else {
        return 1;
    };
    if smallest.memory == 0 {
        return 1;
    }

    let slots = allocatable_memory / smallest.memory;
    u32::try_from(slots).unwrap_or(u32::MAX).min(limit)
}

/// [`virtual_slots`] for a configured chip family.
pub fn virtual_slots_for(family: &ChipFamilyConfig) -> u32 {
    virtual_slots(
        family.memory_allocatable,
        &family.templates,
        family.virtual_device_limit(),
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn template(memory: u64) -> CapacityTemplate {
        CapacityTemplate {
            name: format!("vir{memory}"),
            memory,
            ai_core: 0,
        }
    }

    #[test]
    fn smallest_template_is_the_slot_unit() {
        let templates = vec![template(4096), template(8192), template(16384)];
        assert_eq!(virtual_slots(32768, &templates, 32), 8);
    }

    #[test]
    fn no_templates_means_whole_device() {
        assert_eq!(virtual_slots(32768, &[], 32), 1);
    }

    #[test]
    fn result_is_floored() {
        let templates = vec![template(3000)];
        assert_eq!(virtual_slots(10000, &templates, 32), 3);
    }

    #[test]
    fn result_never_exceeds_hardware_limit() {
        let templates = vec![template(1024)];
        assert_eq!(virtual_slots(65536, &templates, 7), 7);
    }

    #[test]
    fn family_limit_defaults_to_core_count() {
        let family = ChipFamilyConfig {
            chip_name: "910B3".to_string(),
            common_word: "Ascend910B3".to_string(),
            resource_name: "huawei.com/Ascend910B3".to_string(),
            memory_allocatable: 65536,
            memory_capacity: 65536,
            ai_core: 4,
            max_virtual_devices: None,
            templates: vec![template(8192)],
        };
        assert_eq!(virtual_slots_for(&family), 4);
    }
}
