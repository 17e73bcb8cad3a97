//! RPU register addresses, memory locations and protocol constants.

// ========= MCU (LMAC) control block
pub(crate) const RPU_REG_MIPS_MCU_CONTROL: u32 = 0xA400_0000;
pub(crate) const RPU_REG_MIPS_MCU_UCCP_INT_STATUS: u32 = 0xA400_0004;
pub(crate) const RPU_REG_MIPS_MCU_UCCP_INT_CLEAR: u32 = 0xA400_000C;
pub(crate) const RPU_REG_MIPS_MCU_STATUS: u32 = 0xA400_0018;
pub(crate) const RPU_REG_MIPS_MCU_SYS_CORE_MEM_CTRL: u32 = 0xA400_0030;
pub(crate) const RPU_REG_MIPS_MCU_SYS_CORE_MEM_WDATA: u32 = 0xA400_0034;
pub(crate) const RPU_REG_MIPS_MCU_TIMER: u32 = 0xA400_004C;
pub(crate) const RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_0: u32 = 0xA400_0050;
pub(crate) const RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_1: u32 = 0xA400_0054;
pub(crate) const RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_2: u32 = 0xA400_0058;
pub(crate) const RPU_REG_MIPS_MCU_BOOT_EXCP_INSTR_3: u32 = 0xA400_005C;

// ========= MCU2 (UMAC) control block
pub(crate) const RPU_REG_MIPS_MCU2_CONTROL: u32 = 0xA400_0100;
pub(crate) const RPU_REG_MIPS_MCU2_STATUS: u32 = 0xA400_0118;
pub(crate) const RPU_REG_MIPS_MCU2_SYS_CORE_MEM_CTRL: u32 = 0xA400_0130;
pub(crate) const RPU_REG_MIPS_MCU2_SYS_CORE_MEM_WDATA: u32 = 0xA400_0134;
pub(crate) const RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_0: u32 = 0xA400_0150;
pub(crate) const RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_1: u32 = 0xA400_0154;
pub(crate) const RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_2: u32 = 0xA400_0158;
pub(crate) const RPU_REG_MIPS_MCU2_BOOT_EXCP_INSTR_3: u32 = 0xA400_015C;

pub(crate) const RPU_REG_BIT_MIPS_MCU_SOFT_RESET: u32 = 0;
pub(crate) const RPU_REG_BIT_MIPS_MCU_STATUS_READY: u32 = 0;
pub(crate) const RPU_REG_BIT_MIPS_WATCHDOG_INT_STATUS: u32 = 1;
pub(crate) const RPU_REG_BIT_MIPS_WATCHDOG_INT_CLEAR: u32 = 1;
pub(crate) const RPU_REG_MIPS_MCU_TIMER_RESET_VAL: u32 = 0x00FF_FFFF;

// ========= Host interrupt block
pub(crate) const RPU_REG_INT_FROM_RPU_CTRL: u32 = 0xA400_0400;
pub(crate) const RPU_REG_BIT_INT_FROM_RPU_CTRL: u32 = 17;
pub(crate) const RPU_REG_INT_TO_MCU_CTRL: u32 = 0xA400_0480;
pub(crate) const RPU_REG_INT_FROM_MCU_ACK: u32 = 0xA400_0488;
pub(crate) const RPU_REG_BIT_INT_FROM_MCU_ACK: u32 = 31;
pub(crate) const RPU_REG_INT_FROM_MCU_CTRL: u32 = 0xA400_0494;
pub(crate) const RPU_REG_BIT_INT_FROM_MCU_CTRL: u32 = 31;

// ========= Boot entry points written to the sleep controller
pub(crate) const RPU_REG_UCC_SLEEP_CTRL_DATA_0: u32 = 0xA400_2C2C;
pub(crate) const RPU_REG_UCC_SLEEP_CTRL_DATA_1: u32 = 0xA400_2C30;

// ========= PBUS
pub(crate) const PBUS_REG_CLK_CTRL: u32 = 0xA500_8C20;
pub(crate) const PBUS_CLK_ENABLE: u32 = 0x0100;

// ========= Shared memory
pub(crate) const RPU_MEM_UMAC_BOOT_SIG: u32 = 0xB000_0000;
pub(crate) const RPU_MEM_HPQ_INFO: u32 = 0xB000_0024;
pub(crate) const RPU_MEM_PKT_BASE: u32 = 0xB000_5000;
pub(crate) const RPU_MEM_LMAC_BOOT_SIG: u32 = 0xB700_0D50;
pub(crate) const RPU_MEM_RX_CMD_BASE: u32 = 0xB700_0D58;

pub(crate) const RPU_PKTRAM_SIZE: u32 = 0x2C000;
pub(crate) const RPU_MCU_CORE_INDIRECT_BASE: u32 = 0xC000_0000;
pub(crate) const RPU_ADDR_MASK_OFFSET: u32 = 0x00FF_FFFF;

pub(crate) const BOOT_SIGNATURE: u32 = 0x5A5A_5A5A;

/// Instructions injected at the boot exception vector; they jump to the
/// address the sleep controller holds.
pub(crate) const BOOT_EXCP_VECT: [u32; 4] = [0x3c1a_8000, 0x275a_0000, 0x0340_0008, 0x0000_0000];

// ========= Patch destinations (RPU view)
pub(crate) const RPU_MEM_LMAC_PATCH_PRI: u32 = 0x8004_9000;
pub(crate) const RPU_MEM_LMAC_PATCH_SEC: u32 = 0x8004_4000;
pub(crate) const RPU_MEM_UMAC_PATCH_PRI: u32 = 0x8009_4400;
pub(crate) const RPU_MEM_UMAC_PATCH_SEC: u32 = 0x8008_C000;

// Entry points of the primary patches, as seen by each core
pub(crate) const RPU_LMAC_BOOT_ENTRY: u32 = 0x9000;
pub(crate) const RPU_UMAC_BOOT_ENTRY: u32 = 0x1_4400;

// ========= Messaging
pub(crate) const RPU_CMD_START_MAGIC: u32 = 0xDEAD;
pub(crate) const RPU_EVENT_COMMON_SIZE_MAX: usize = 128;
pub(crate) const MAX_EVENT_POOL_LEN: usize = 1000;
pub(crate) const RPU_DATA_CMD_SIZE_MAX_RX: u32 = 8;
pub(crate) const MAX_NUM_OF_RX_QUEUES: usize = 3;
pub(crate) const RX_BUF_HEADROOM: u32 = 4;

// ========= Bus status registers
pub(crate) const SR1_RPU_AWAKE: u8 = 0x02;
pub(crate) const SR1_RPU_READY: u8 = 0x04;
pub(crate) const SR2_RPU_WAKEUP_REQ: u8 = 0x01;
