use crate::fake_stack::*;
use anyhow::Result;
use framewalk::*;
use std::ptr;

const TEXT2: usize = TEXT + 0x10_0000;

fn same_manager(a: &dyn CodeManager, b: &dyn CodeManager) -> bool {
    ptr::addr_eq(a, b)
}

#[test]
fn register_and_lookup() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let first = manager(&code_info)?;
    let second = AotCodeManager::new(TEXT2..TEXT2 + TEXT_LEN, &code_info, TYPE_HANDLES, classlib())?;

    let registry = CodeManagerRegistry::new();
    assert!(registry.is_empty());
    assert_eq!(registry.register(first.text_range(), &first)?, 0);
    assert_eq!(registry.register(second.text_range(), &second)?, 1);
    assert_eq!(registry.len(), 2);

    assert!(same_manager(registry.lookup(LEAF_PC).unwrap(), &first));
    assert!(same_manager(registry.lookup(TEXT2 + 0x20).unwrap(), &second));
    assert!(registry.lookup(TEXT + TEXT_LEN).is_none());

    let mut info = MethodInfo::new();
    let owner = registry.find_method_info(TEXT2 + method::MIDDLE + 0x30, &mut info).unwrap();
    assert!(same_manager(owner, &second));
    assert_eq!(owner.method_start_address(&info), TEXT2 + method::MIDDLE);

    // Inside a registered range but between methods.
    assert!(registry.find_method_info(TEXT + 0x800, &mut info).is_none());
    assert!(registry.find_method_info(NATIVE_RA, &mut info).is_none());

    assert_eq!(
        format!("{registry:x?}"),
        format!("[{:x?}, {:x?}]", TEXT..TEXT + TEXT_LEN, TEXT2..TEXT2 + TEXT_LEN)
    );
    Ok(())
}

#[test]
fn reject_bad_ranges() -> Result<()> {
    let code_info = chain_image()?;
    let manager = manager(&code_info)?;

    let registry = CodeManagerRegistry::new();
    registry.register(TEXT..TEXT + TEXT_LEN, &manager)?;
    assert_eq!(
        registry.register(TEXT + 0x800..TEXT + 0x2000, &manager),
        Err(RegistryError::Overlap {
            new: TEXT + 0x800..TEXT + 0x2000,
            existing: TEXT..TEXT + TEXT_LEN,
        })
    );
    assert!(registry.register(TEXT - 0x10..TEXT + 1, &manager).is_err());
    assert_eq!(
        registry.register(TEXT2..TEXT2, &manager),
        Err(RegistryError::EmptyRange(TEXT2..TEXT2))
    );
    // Adjacent ranges do not overlap.
    registry.register(TEXT - 0x10..TEXT, &manager)?;
    registry.register(TEXT + TEXT_LEN..TEXT + TEXT_LEN + 1, &manager)?;
    assert_eq!(registry.len(), 3);
    Ok(())
}

#[test]
fn lookup_while_registering() -> Result<()> {
    let _ = env_logger::try_init();

    let code_info = chain_image()?;
    let managers = (0..16)
        .map(|i| {
            let base = TEXT + i * 0x10_0000;
            AotCodeManager::new(base..base + TEXT_LEN, &code_info, TYPE_HANDLES, classlib())
        })
        .collect::<Result<Vec<_>>>()?;

    let registry = CodeManagerRegistry::new();
    std::thread::scope(|s| {
        for chunk in managers.chunks(4) {
            let registry = &registry;
            s.spawn(move || {
                for manager in chunk {
                    registry.register(manager.text_range(), manager).unwrap();
                }
            });
        }
        s.spawn(|| {
            let mut info = MethodInfo::new();
            for _ in 0..1000 {
                for manager in &managers {
                    let pc = manager.text_range().start + 0x20;
                    if let Some(owner) = registry.find_method_info(pc, &mut info) {
                        assert!(same_manager(owner, manager));
                    }
                }
            }
        });
    });
    assert_eq!(registry.len(), 16);
    for manager in &managers {
        assert!(same_manager(registry.lookup(manager.text_range().start).unwrap(), manager));
    }
    Ok(())
}
